/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod handling;
mod reporting;

pub use handling::{convert_log_report_error, ErrorHandling, GetErrorHandling};
pub use reporting::{
    report_breadcrumb, report_error_to_app, set_application_error_reporter,
    unset_application_error_reporter, ApplicationErrorReporter,
};

// Re-export the log macros so the components have a single logging import.
pub use log::{debug, error, info, trace, warn};
