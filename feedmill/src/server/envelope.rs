/*!
JSON response envelope: `{success, data?, error?: {code, message, detail?}}`.
Handlers return `ApiResult<T>`; the error half maps the engine taxonomy to
HTTP statuses without string matching.
*/

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match &self.0 {
            Error::NotFound { .. } => Status::NotFound,
            Error::InvalidInput(_) | Error::QuotaExceeded { .. } => Status::BadRequest,
            Error::Unauthorized => Status::Unauthorized,
            Error::Forbidden => Status::Forbidden,
            Error::Conflict(_) => Status::Conflict,
            Error::ProviderUnreachable(_)
            | Error::ProviderRejected(_)
            | Error::ProviderFormatUnknown(_) => Status::BadGateway,
            Error::RateLimited => Status::TooManyRequests,
            Error::Db(_) | Error::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            tracing::error!("internal error on {}: {}", req.uri(), self.0);
        }
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.0.code(),
                message: self.0.to_string(),
                detail: self.0.detail(),
            }),
        };
        let mut response = Json(body).respond_to(req)?;
        response.set_status(status);
        Ok(response)
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_carry_the_violated_quota_name() {
        let err = ApiError(Error::QuotaExceeded { which: "feeds" });
        assert_eq!(err.status(), Status::BadRequest);
        assert_eq!(err.0.code(), "QUOTA_EXCEEDED");
        assert_eq!(err.0.detail().as_deref(), Some("feeds"));
    }

    #[test]
    fn provider_errors_map_to_bad_gateway() {
        assert_eq!(
            ApiError(Error::ProviderUnreachable("x".into())).status(),
            Status::BadGateway
        );
        assert_eq!(ApiError(Error::RateLimited).status(), Status::TooManyRequests);
    }
}
