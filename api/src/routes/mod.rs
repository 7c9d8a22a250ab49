pub mod admin;
pub mod chat;
pub mod handoffs;
pub mod health;

use axum::http::HeaderMap;

use crate::error::AppError;
use crate::state::AppState;

/// Operator-token gate for administrative routes.
///
/// Accepts `Authorization: Bearer <token>` matched against the configured
/// operator token. When no token is configured the admin surface is disabled
/// outright rather than left open.
pub fn ensure_operator(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    check_operator_token(state.cfg.admin_token.as_deref(), auth_header)
}

fn check_operator_token(
    expected: Option<&str>,
    auth_header: Option<&str>,
) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Err(AppError::Forbidden {
            message: "The operator API is not enabled on this deployment.".to_string(),
        });
    };
    let presented = auth_header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_bearer_token_passes() {
        assert!(check_operator_token(Some("s3cret"), Some("Bearer s3cret")).is_ok());
    }

    #[test]
    fn wrong_or_missing_token_is_unauthorized() {
        assert!(matches!(
            check_operator_token(Some("s3cret"), Some("Bearer nope")),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            check_operator_token(Some("s3cret"), None),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            check_operator_token(Some("s3cret"), Some("s3cret")),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn unconfigured_token_disables_the_surface() {
        assert!(matches!(
            check_operator_token(None, Some("Bearer anything")),
            Err(AppError::Forbidden { .. })
        ));
    }
}
