//! Response construction helpers shared by the routers and the engine adapters

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use hyper::{Response, StatusCode};

/// Body type of every response the server writes
pub type ServerBody = BoxBody<Bytes, hyper::Error>;

/// Create a response carrying `body` with the given content type
pub fn bytes_response(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: &'static str,
) -> Response<ServerBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ServerBody> {
    bytes_response(status, body.to_owned(), "text/plain; charset=utf-8")
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ServerBody> {
    text_response(status, message)
}

/// Create an HTML response
pub fn html_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ServerBody> {
    bytes_response(status, body, "text/html; charset=utf-8")
}

/// Create a redirect to `location`
pub fn redirect_response(status: StatusCode, location: HeaderValue) -> Response<ServerBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response.headers_mut().insert(LOCATION, location);
    response
}

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ServerBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub fn empty_body() -> ServerBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
