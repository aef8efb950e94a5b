//! Shared API response and pagination types

pub mod pagination;
pub mod response;

#[allow(unused_imports)]
pub use pagination::{Paginated, PaginationMeta, PaginationParams};
#[allow(unused_imports)]
pub use response::{DataResponse, MessageResponse};
