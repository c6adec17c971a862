//! HTTP/1.1 protocol types.
//!
//! The primitives the memoization layer operates on: [`Method`],
//! [`StatusCode`], the order-preserving multi-value [`Headers`] map,
//! [`Request`], and [`Response`].

pub mod headers;
pub mod method;
pub mod request;
pub mod response;
pub mod status;

pub use headers::Headers;
pub use method::Method;
pub use request::Request;
pub use response::Response;
pub use status::StatusCode;
