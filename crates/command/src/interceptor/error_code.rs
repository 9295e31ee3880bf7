//! Error-code enrichment.
//!
//! Every failure leaving the chain carries a stable numeric code that
//! callers can report without parsing messages.
//!
//! | Code | Meaning |
//! |------|---------|
//! | [`FALLBACK_ERROR_CODE`] | Any failure without a more specific code |
//! | [`OPTIMISTIC_LOCKING_ERROR_CODE`] | Write conflict |
//! | [`MIN_CUSTOM_ERROR_CODE`]..=[`MAX_CUSTOM_ERROR_CODE`] | Assigned by commands or an [`ErrorCodeProvider`] |

use std::{fmt, ops::RangeInclusive, sync::Arc};

use async_trait::async_trait;

use super::{CommandInterceptor, Invocation, Next};
use crate::{
    command::{CommandOutput, DynCommand},
    error::{PipelineError, PipelineResult},
};

/// Code of a failure nothing more specific was found for.
pub const FALLBACK_ERROR_CODE: u32 = 0;

/// Code of a write conflict.
pub const OPTIMISTIC_LOCKING_ERROR_CODE: u32 = 1;

/// Lowest code available to commands and providers.
pub const MIN_CUSTOM_ERROR_CODE: u32 = 20_000;

/// Highest code available to commands and providers.
pub const MAX_CUSTOM_ERROR_CODE: u32 = 39_999;

const CUSTOM_CODES: RangeInclusive<u32> = MIN_CUSTOM_ERROR_CODE..=MAX_CUSTOM_ERROR_CODE;

/// Maps failures to application-specific codes.
pub trait ErrorCodeProvider: Send + Sync + fmt::Debug {
    /// Returns a code in the custom range for `error`, or `None` to fall back
    /// to the built-in codes.
    fn provide_code(&self, error: &PipelineError) -> Option<u32>;
}

/// Attaches a diagnostic code to every failure.
#[derive(Debug, Clone, Default)]
pub struct ErrorCodeInterceptor {
    provider: Option<Arc<dyn ErrorCodeProvider>>,
}

impl ErrorCodeInterceptor {
    /// Creates an interceptor using only the built-in codes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an interceptor consulting `provider` first.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn ErrorCodeProvider>) -> Self {
        Self { provider: Some(provider) }
    }

    fn assign(&self, error: PipelineError) -> PipelineError {
        let builtin = builtin_code(&error);
        if let Some(code) = error.code() {
            if code == builtin || CUSTOM_CODES.contains(&code) {
                return error;
            }
            tracing::warn!(code, "error code outside the custom range replaced");
        }

        let provided = self.provider.as_ref().and_then(|provider| provider.provide_code(&error));
        let code = match provided {
            Some(code) if CUSTOM_CODES.contains(&code) => code,
            Some(code) => {
                tracing::warn!(code, "provided error code outside the custom range ignored");
                builtin
            },
            None => builtin,
        };
        error.with_code(code)
    }
}

fn builtin_code(error: &PipelineError) -> u32 {
    if error.is_conflict() { OPTIMISTIC_LOCKING_ERROR_CODE } else { FALLBACK_ERROR_CODE }
}

#[async_trait]
impl CommandInterceptor for ErrorCodeInterceptor {
    async fn execute(
        &self,
        invocation: &mut Invocation<'_>,
        command: &dyn DynCommand,
        next: Next<'_>,
    ) -> PipelineResult<CommandOutput> {
        next.run(invocation, command).await.map_err(|err| self.assign(err))
    }

    fn name(&self) -> &'static str {
        "error_code"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::ErrorKind;

    #[derive(Debug)]
    struct FixedProvider(u32);

    impl ErrorCodeProvider for FixedProvider {
        fn provide_code(&self, _error: &PipelineError) -> Option<u32> {
            Some(self.0)
        }
    }

    #[rstest]
    #[case::command(PipelineError::command("boom"), FALLBACK_ERROR_CODE)]
    #[case::conflict(PipelineError::conflict("stale"), OPTIMISTIC_LOCKING_ERROR_CODE)]
    #[case::custom_kept(PipelineError::command("boom").with_code(20_500), 20_500)]
    #[case::reserved_replaced(PipelineError::command("boom").with_code(42), FALLBACK_ERROR_CODE)]
    #[case::builtin_kept(PipelineError::conflict("stale").with_code(1), OPTIMISTIC_LOCKING_ERROR_CODE)]
    fn test_builtin_codes(#[case] error: PipelineError, #[case] expected: u32) {
        let coded = ErrorCodeInterceptor::new().assign(error);
        assert_eq!(coded.code(), Some(expected));
    }

    #[rstest]
    #[case::in_range(30_000, 30_000)]
    #[case::below_range(19_999, FALLBACK_ERROR_CODE)]
    #[case::above_range(40_000, FALLBACK_ERROR_CODE)]
    fn test_provider_codes(#[case] provided: u32, #[case] expected: u32) {
        let interceptor = ErrorCodeInterceptor::with_provider(Arc::new(FixedProvider(provided)));
        let coded = interceptor.assign(PipelineError::command("boom"));
        assert_eq!(coded.code(), Some(expected));
        assert_eq!(coded.kind(), ErrorKind::Command);
    }
}
