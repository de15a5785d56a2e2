//! Requests, responses and the tensors they carry

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::ResponseError;
use crate::{Error, Result};

/// Opaque correlation token chosen by the caller
pub type RequestId = String;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// Boolean, one byte per element
    Bool,
    /// Unsigned 8-bit integer
    Uint8,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// Half precision float
    Fp16,
    /// Single precision float
    Fp32,
    /// Double precision float
    Fp64,
    /// Variable-length byte strings
    Bytes,
}

impl DataType {
    /// Size of one element in bytes, `None` for variable-length types
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => Some(1),
            DataType::Int16 | DataType::Fp16 => Some(2),
            DataType::Int32 | DataType::Fp32 => Some(4),
            DataType::Int64 | DataType::Fp64 => Some(8),
            DataType::Bytes => None,
        }
    }
}

/// Named tensor: an input of a request or an output of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    /// Tensor name (e.g. `PYTHON_INPUT_0`)
    pub name: String,
    /// Element type
    pub datatype: DataType,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Raw little-endian contents
    pub data: Bytes,
}

impl Tensor {
    /// Create a tensor, checking the byte length against the shape
    pub fn new(
        name: impl Into<String>,
        datatype: DataType,
        shape: Vec<usize>,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let name = name.into();
        let data = data.into();
        if let Some(size) = datatype.element_size() {
            let expected = shape
                .iter()
                .try_fold(size, |bytes, &dim| bytes.checked_mul(dim))
                .ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "tensor '{}' with shape {:?} is too large",
                        name, shape
                    ))
                })?;
            if expected != data.len() {
                return Err(Error::InvalidRequest(format!(
                    "tensor '{}' with shape {:?} needs {} bytes, got {}",
                    name,
                    shape,
                    expected,
                    data.len()
                )));
            }
        }
        Ok(Self {
            name,
            datatype,
            shape,
            data,
        })
    }

    /// Raw byte buffer as a `[1, len]` UINT8 tensor
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            datatype: DataType::Uint8,
            shape: vec![1, data.len()],
            data,
        }
    }

    /// Number of elements described by the shape
    pub fn element_count(&self) -> usize {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
            .unwrap_or(usize::MAX)
    }

    /// Size of the contents in bytes
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Stack variable-length byte buffers into one `[n, max_len]` UINT8 tensor
///
/// Shorter buffers are zero padded at the end.
pub fn pad_and_stack(name: impl Into<String>, buffers: &[Vec<u8>]) -> Result<Tensor> {
    let name = name.into();
    let max_len = buffers
        .iter()
        .map(Vec::len)
        .max()
        .ok_or_else(|| Error::InvalidRequest(format!("no buffers to stack for '{}'", name)))?;

    let mut data = Vec::with_capacity(max_len * buffers.len());
    for buffer in buffers {
        data.extend_from_slice(buffer);
        data.resize(data.len() + (max_len - buffer.len()), 0);
    }

    Tensor::new(name, DataType::Uint8, vec![buffers.len(), max_len], data)
}

/// Inference request submitted on a decoupled stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferRequest {
    /// Correlation id, unique among the requests in flight on a session
    pub id: RequestId,
    /// Target model
    pub model_name: String,
    /// Target model version (`None` = latest)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Named inputs
    pub inputs: Vec<Tensor>,
    /// Outputs to extract from every response (empty = all)
    #[serde(default)]
    pub requested_outputs: Vec<String>,
    /// Free-form request parameters
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl InferRequest {
    /// Create a request without inputs
    pub fn new(id: impl Into<RequestId>, model_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            model_version: None,
            inputs: Vec::new(),
            requested_outputs: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    /// Builder pattern: add an input tensor
    pub fn with_input(mut self, tensor: Tensor) -> Self {
        self.inputs.push(tensor);
        self
    }

    /// Builder pattern: request a named output
    pub fn with_requested_output(mut self, name: impl Into<String>) -> Self {
        self.requested_outputs.push(name.into());
        self
    }

    /// Builder pattern: pin a model version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Builder pattern: add a request parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Look up an input by name
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Whether the caller wants `name` in its responses
    pub fn wants_output(&self, name: &str) -> bool {
        self.requested_outputs.is_empty() || self.requested_outputs.iter().any(|o| o == name)
    }

    /// Reject malformed requests before they are transmitted
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidRequest("request id must not be empty".into()));
        }
        if self.inputs.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "request {} has no inputs",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(Error::InvalidRequest(format!(
                    "request {} has duplicate input '{}'",
                    self.id, input.name
                )));
            }
        }
        Ok(())
    }
}

/// Body of a response: outputs, or the error that ended the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Output tensors of one increment of work
    Outputs(Vec<Tensor>),
    /// Failure description
    Error(ResponseError),
}

/// One item of a request's response sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferResponse {
    /// Originating request
    pub request_id: RequestId,
    /// Model that produced the response
    pub model_name: String,
    /// Position within the request's response sequence, starting at 0
    pub sequence: u64,
    /// Outputs or error
    pub payload: ResponsePayload,
    /// No further responses follow for this request
    pub is_final: bool,
}

impl InferResponse {
    /// Intermediate response carrying outputs
    pub fn chunk(
        request_id: impl Into<RequestId>,
        model_name: impl Into<String>,
        sequence: u64,
        outputs: Vec<Tensor>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model_name: model_name.into(),
            sequence,
            payload: ResponsePayload::Outputs(outputs),
            is_final: false,
        }
    }

    /// Flag-only completion marker
    pub fn final_marker(
        request_id: impl Into<RequestId>,
        model_name: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            is_final: true,
            ..Self::chunk(request_id, model_name, sequence, Vec::new())
        }
    }

    /// Error response; always final
    pub fn error(
        request_id: impl Into<RequestId>,
        model_name: impl Into<String>,
        sequence: u64,
        error: ResponseError,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model_name: model_name.into(),
            sequence,
            payload: ResponsePayload::Error(error),
            is_final: true,
        }
    }

    /// Whether this response reports a failure
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// The error description, if any
    pub fn error_detail(&self) -> Option<&ResponseError> {
        match &self.payload {
            ResponsePayload::Error(e) => Some(e),
            ResponsePayload::Outputs(_) => None,
        }
    }

    /// Output tensors (empty for error responses and bare final markers)
    pub fn outputs(&self) -> &[Tensor] {
        match &self.payload {
            ResponsePayload::Outputs(outputs) => outputs,
            ResponsePayload::Error(_) => &[],
        }
    }

    /// Look up an output by name
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs().iter().find(|t| t.name == name)
    }

    /// Final marker without outputs
    pub fn is_bare_final(&self) -> bool {
        self.is_final && !self.is_error() && self.outputs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseErrorKind;

    #[test]
    fn test_tensor_shape_validation() {
        assert!(Tensor::new("x", DataType::Fp32, vec![2, 2], vec![0u8; 16]).is_ok());

        let err = Tensor::new("x", DataType::Fp32, vec![2, 2], vec![0u8; 15]).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Variable-length types are not checked
        assert!(Tensor::new("s", DataType::Bytes, vec![3], vec![1u8, 2]).is_ok());
    }

    #[test]
    fn test_tensor_shape_overflow_rejected() {
        let err = Tensor::new("huge", DataType::Fp64, vec![usize::MAX, 2], vec![0u8; 8]).unwrap_err();
        match err {
            Error::InvalidRequest(message) => assert!(message.contains("too large")),
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_pad_and_stack() {
        let stacked = pad_and_stack("INPUT_0", &[vec![1, 2, 3], vec![4], vec![5, 6]]).unwrap();
        assert_eq!(stacked.shape, vec![3, 3]);
        assert_eq!(&stacked.data[..], &[1, 2, 3, 4, 0, 0, 5, 6, 0]);

        assert!(pad_and_stack("INPUT_0", &[]).is_err());
    }

    #[test]
    fn test_request_validation() {
        let ok = InferRequest::new("req0", "decoder")
            .with_input(Tensor::from_bytes("PYTHON_INPUT_0", vec![0u8; 4]));
        assert!(ok.validate().is_ok());

        let empty_id = InferRequest::new("", "decoder")
            .with_input(Tensor::from_bytes("PYTHON_INPUT_0", vec![0u8; 4]));
        assert!(empty_id.validate().is_err());

        let no_inputs = InferRequest::new("req1", "decoder");
        assert!(no_inputs.validate().is_err());

        let dup = ok
            .clone()
            .with_input(Tensor::from_bytes("PYTHON_INPUT_0", vec![1u8]));
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_requested_output_filter() {
        let all = InferRequest::new("a", "m");
        assert!(all.wants_output("OUTPUT_0"));

        let some = InferRequest::new("a", "m").with_requested_output("OUTPUT_1");
        assert!(!some.wants_output("OUTPUT_0"));
        assert!(some.wants_output("OUTPUT_1"));
    }

    #[test]
    fn test_response_accessors() {
        let chunk = InferResponse::chunk(
            "a",
            "m",
            0,
            vec![Tensor::from_bytes("OUT", vec![7u8; 3])],
        );
        assert!(!chunk.is_error());
        assert_eq!(chunk.output("OUT").map(Tensor::byte_size), Some(3));

        let marker = InferResponse::final_marker("a", "m", 1);
        assert!(marker.is_bare_final());

        let err = InferResponse::error(
            "a",
            "m",
            2,
            ResponseError::new(ResponseErrorKind::Cancelled, "stop"),
        );
        assert!(err.is_final);
        assert!(err.outputs().is_empty());
        assert_eq!(err.error_detail().map(|e| e.kind), Some(ResponseErrorKind::Cancelled));
    }

    #[test]
    fn test_datatype_serde_names() {
        let json = serde_json::to_string(&DataType::Uint8).unwrap();
        assert_eq!(json, "\"UINT8\"");
        let dt: DataType = serde_json::from_str("\"FP32\"").unwrap();
        assert_eq!(dt, DataType::Fp32);
    }
}
