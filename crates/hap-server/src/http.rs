//! Request/response value types at the transport boundary.
//!
//! The engine never touches sockets or HTTP framing; the transport
//! collaborator converts between the wire and these structs.

/// HTTP method subset the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

/// One request as delivered by the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            body: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

pub const CONTENT_TYPE_JSON: &str = "application/hap+json";
pub const CONTENT_TYPE_TLV: &str = "application/pairing+tlv8";

/// One response for the transport to frame and send.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok_json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(CONTENT_TYPE_JSON),
            body,
        }
    }

    pub fn ok_tlv(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some(CONTENT_TYPE_TLV),
            body,
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn bad_request() -> Self {
        Self {
            status: 400,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn internal_error() -> Self {
        Self {
            status: 500,
            content_type: None,
            body: Vec::new(),
        }
    }
}
