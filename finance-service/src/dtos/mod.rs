//! Request and response shapes of the finance RPC endpoints.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;

use crate::models::MilestoneKey;
use service_core::error::AppError;
use uuid::Uuid;

pub(crate) fn parse_id(field: &str, raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::field(field, format!("Invalid {}: '{}'", field, raw)))
}

pub(crate) fn parse_milestone_key(raw: &str) -> Result<MilestoneKey, AppError> {
    raw.trim()
        .parse()
        .map_err(|e: crate::models::milestone::InvalidMilestoneKey| AppError::field("milestone_key", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ids_name_their_field() {
        let err = parse_id("order_id", "nope").unwrap_err();
        assert_eq!(err.to_string(), "Invalid order_id: 'nope'");
        assert!(parse_id("order_id", &format!(" {} ", Uuid::nil())).is_ok());
    }

    #[test]
    fn milestone_keys_parse_or_fail_on_the_key_field() {
        assert_eq!(parse_milestone_key("semester_2").unwrap(), MilestoneKey::semester(2));
        match parse_milestone_key("monthly_1").unwrap_err() {
            AppError::FieldError { errors, .. } => assert!(errors.contains_key("milestone_key")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
