use serde::Deserialize;

mod handler;
pub use handler::router;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadNumbersRequest {
    pub file_name: Option<String>,
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDelayRequest {
    pub delay_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBudgetRequest {
    pub call_duration_budget_seconds: u64,
}

/// `phoneNumber: null` clears the manual selection and falls back to the
/// random policy.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectCallerIdRequest {
    pub phone_number: Option<String>,
}
