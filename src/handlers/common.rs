//! Response and request plumbing shared by the storefront handlers.

use crate::errors::ApiError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

const FIRST_PAGE: u64 = 1;
const DEFAULT_PAGE_SIZE: u64 = 20;

/// 200 with `data` as the JSON body
pub fn ok_json<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// 201 with `data` as the JSON body
pub fn created_json<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Runs the payload's field rules; every failing field is reported in one 400.
pub fn validate_payload<T: Validate>(payload: &T) -> Result<(), ApiError> {
    payload
        .validate()
        .map_err(|e| ApiError::ValidationError(format!("Validation failed: {}", e)))
}

/// `?page=&per_page=` on list endpoints. The service clamps out-of-range values.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "first_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub per_page: u64,
}

fn first_page() -> u64 {
    FIRST_PAGE
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

/// One page of a list plus where it sits in the whole
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, page: u64, per_page: u64, total: u64) -> Self {
        Self {
            data,
            pagination: PageInfo {
                page,
                per_page,
                total,
                total_pages: total.div_ceil(per_page.max(1)),
            },
        }
    }
}
