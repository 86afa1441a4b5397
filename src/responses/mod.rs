//! API Response Types
//!
//! Envelope types shared by every handler: a success wrapper, a paginated
//! list wrapper, and a bare acknowledgment.

use serde::Serialize;

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }
}

/// Paginated list wrapper
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T: Serialize> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

#[derive(Debug, Serialize)]
pub struct PaginationMeta {
    pub current_page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_more: bool,
}

impl<T: Serialize> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = if per_page > 0 {
            (total + per_page - 1) / per_page
        } else {
            0
        };
        Self {
            success: true,
            data,
            pagination: PaginationMeta {
                current_page: page,
                per_page,
                total,
                total_pages,
                has_more: page < total_pages,
            },
        }
    }
}

/// Acknowledgment without a payload
#[derive(Debug, Serialize)]
pub struct EmptyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EmptyResponse {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_math() {
        let page = PaginatedResponse::new(vec![1, 2, 3], 45, 2, 20);
        assert_eq!(page.pagination.total_pages, 3);
        assert!(page.pagination.has_more);

        let last = PaginatedResponse::new(vec![1], 45, 3, 20);
        assert!(!last.pagination.has_more);

        let empty = PaginatedResponse::<i32>::new(vec![], 0, 1, 20);
        assert_eq!(empty.pagination.total_pages, 0);
        assert!(!empty.pagination.has_more);
    }
}
