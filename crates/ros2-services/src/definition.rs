// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service message definitions.
//!
//! The engines move opaque bytes; a [`ServiceDefinition`] names the request
//! and response types of a service and converts them to and from those
//! bytes (typically CDR, produced by generated message code).

use crate::error::CodecError;

/// Request/response types of a service and their payload codec.
///
/// # Example
///
/// ```
/// use ros2_services::{CodecError, ServiceDefinition};
///
/// struct Echo;
///
/// impl ServiceDefinition for Echo {
///     type Request = String;
///     type Response = String;
///
///     fn encode_request(request: &String) -> Result<Vec<u8>, CodecError> {
///         Ok(request.as_bytes().to_vec())
///     }
///
///     fn decode_request(bytes: &[u8]) -> Result<String, CodecError> {
///         String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Invalid(e.to_string()))
///     }
///
///     fn encode_response(response: &String) -> Result<Vec<u8>, CodecError> {
///         Self::encode_request(response)
///     }
///
///     fn decode_response(bytes: &[u8]) -> Result<String, CodecError> {
///         Self::decode_request(bytes)
///     }
/// }
/// ```
pub trait ServiceDefinition: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn encode_request(request: &Self::Request) -> Result<Vec<u8>, CodecError>;
    fn decode_request(bytes: &[u8]) -> Result<Self::Request, CodecError>;
    fn encode_response(response: &Self::Response) -> Result<Vec<u8>, CodecError>;
    fn decode_response(bytes: &[u8]) -> Result<Self::Response, CodecError>;
}

/// Pass-through definition for callers that serialize payloads themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawService;

impl ServiceDefinition for RawService {
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    fn encode_request(request: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(request.clone())
    }

    fn decode_request(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn encode_response(response: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(response.clone())
    }

    fn decode_response(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}
