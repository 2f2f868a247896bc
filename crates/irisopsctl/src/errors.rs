//! Exit codes for irisopsctl

use irisops_common::OpsError;

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for general errors, including operations that ran and failed
pub const EXIT_GENERAL_ERROR: i32 = 1;

/// Exit code when input was rejected before anything ran
pub const EXIT_VALIDATION: i32 = 65;

/// Exit code when the user declined a confirmation prompt
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code for an error that reached `main`
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OpsError>() {
        Some(OpsError::Validation(_)) | Some(OpsError::Settings(_)) => EXIT_VALIDATION,
        _ => EXIT_GENERAL_ERROR,
    }
}

/// Exit code for a finished operation
pub fn exit_code_for_success(success: bool) -> i32 {
    if success {
        EXIT_SUCCESS
    } else {
        EXIT_GENERAL_ERROR
    }
}
