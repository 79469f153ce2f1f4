//! Maps arbitrary failures to the error categories exposed over HTTP.
//!
//! Classification walks the error's source chain and stops at the first error
//! it recognizes. The reported message is always the outermost one, so callers
//! see the context attached closest to the failure site.

use std::{error::Error as StdError, io};

use crate::{
    error::{ClassifiedError, ErrorCategory, RequestError},
    runtime::RuntimeError,
};

/// Where the failure happened. Only used for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    pub node_name: &'static str,
}

impl ErrorContext {
    pub const fn new(node_name: &'static str) -> Self {
        Self { node_name }
    }
}

/// Classifies an error. Never fails, unknown errors are system errors.
pub fn classify(error: &(dyn StdError + 'static), context: ErrorContext) -> ClassifiedError {
    let message = error.to_string();

    let (category, code) = std::iter::successors(Some(error), |&error| error.source())
        .find_map(|error| match error.downcast_ref::<ClassifiedError>() {
            Some(classified) => Some((classified.category, classified.code.clone())),
            None => recognize(error).map(|(category, code)| (category, code.to_string())),
        })
        .unwrap_or_else(|| (ErrorCategory::System, "500000".to_string()));

    log::debug!(
        "Classified error in {} as {category:?} ({code}): {message}",
        context.node_name
    );

    ClassifiedError {
        category,
        code,
        message,
    }
}

fn recognize(error: &(dyn StdError + 'static)) -> Option<(ErrorCategory, &'static str)> {
    if let Some(error) = error.downcast_ref::<RequestError>() {
        return Some((ErrorCategory::Invalid, error.code()));
    }

    if let Some(error) = error.downcast_ref::<RuntimeError>() {
        return recognize_runtime(error);
    }

    if let Some(error) = error.downcast_ref::<reqwest::Error>() {
        if error.is_timeout() {
            return Some((ErrorCategory::Timeout, "408004"));
        }

        if error.is_connect() {
            return Some((ErrorCategory::System, "500003"));
        }

        return None;
    }

    if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some((ErrorCategory::Timeout, "408005"));
    }

    if let Some(error) = error.downcast_ref::<io::Error>() {
        return match error.kind() {
            io::ErrorKind::TimedOut => Some((ErrorCategory::Timeout, "408006")),
            io::ErrorKind::NotFound => Some((ErrorCategory::NotFound, "404003")),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Some((ErrorCategory::BadRequest, "400006")),
            _ => None,
        };
    }

    None
}

fn recognize_runtime(error: &RuntimeError) -> Option<(ErrorCategory, &'static str)> {
    let recognized = match error {
        RuntimeError::RecursionLimit(_) => (ErrorCategory::Timeout, "408002"),
        RuntimeError::Timeout(_) => (ErrorCategory::Timeout, "408001"),
        RuntimeError::NotFound(_) => (ErrorCategory::NotFound, "404001"),
        RuntimeError::InvalidInput(_) => (ErrorCategory::BadRequest, "400004"),
        RuntimeError::Upstream { status, .. } => match status {
            400 | 422 => (ErrorCategory::BadRequest, "400005"),
            404 => (ErrorCategory::NotFound, "404002"),
            408 | 504 => (ErrorCategory::Timeout, "408003"),
            _ => (ErrorCategory::System, "500002"),
        },
        // The wrapped client error is next in the chain.
        RuntimeError::Http(_) => return None,
        RuntimeError::Cancelled => (ErrorCategory::System, "500004"),
        RuntimeError::Internal(_) => (ErrorCategory::System, "500001"),
    };

    Some(recognized)
}
