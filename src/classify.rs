/// Classification of refresh failures into permanent and transient
use crate::error::Error;

/// How a failed refresh affects future attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The refresh token is unusable; credentials must be purged and the user
    /// must authenticate again.
    Permanent,
    /// The refresh may succeed later with the same credentials.
    Transient,
}

/// Classify an error produced while refreshing the access token.
pub fn classify_refresh_error(error: &Error) -> FailureKind {
    match error {
        Error::NoRefreshToken | Error::MissingField(_) => FailureKind::Permanent,
        // Transport failures, timeouts and local storage trouble say nothing
        // about the refresh token itself.
        Error::HttpError(_)
        | Error::IoError(_)
        | Error::StorageError(_)
        | Error::InvalidUrl(_)
        | Error::InvalidHeader(_) => FailureKind::Transient,
        // A 2xx body that isn't a token response
        Error::JsonError(_) => FailureKind::Permanent,
        Error::RefreshRejected { status, body } | Error::LoginRejected { status, body } => {
            classify_rejection(*status, body)
        }
    }
}

fn classify_rejection(status: u16, body: &str) -> FailureKind {
    if status == 401 {
        return FailureKind::Permanent;
    }

    let text = error_text(body).to_lowercase();
    if status == 500 && (text.contains("invalid_grant") || text.contains("not active")) {
        return FailureKind::Permanent;
    }

    classify_text(&text)
}

fn classify_text(text: &str) -> FailureKind {
    if text.contains("expired") {
        return FailureKind::Permanent;
    }
    if text.contains("invalid") && !text.contains("credentials") {
        return FailureKind::Permanent;
    }
    FailureKind::Transient
}

/// Error text to match against.
///
/// Prefers the `error` and `error_description` fields of a JSON object
/// embedded anywhere in `message`; falls back to the raw message.
pub fn error_text(message: &str) -> String {
    let embedded = match (message.find('{'), message.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<serde_json::Value>(&message[start..=end]).ok()
        }
        _ => None,
    };

    let fields: Vec<&str> = embedded
        .as_ref()
        .map(|value| {
            ["error", "error_description"]
                .iter()
                .filter_map(|field| value.get(*field).and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if fields.is_empty() {
        message.to_string()
    } else {
        fields.join(": ")
    }
}
