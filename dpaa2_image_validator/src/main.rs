//! DPAA2 MC Image Validation Tool - X64/AArch64
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use clap::Parser;
use commandline::CommandLine;
use errors::ValidationAppError;
use validate::ValidationApp;

mod commandline;
mod errors;
mod validate;
mod validation_kind;
mod validation_report;
mod validator;

fn main() -> Result<(), ValidationAppError> {
    let args = CommandLine::parse();
    env_logger::Builder::new().filter_level(args.log_level()).format_timestamp(None).init();
    ValidationApp::new(args).run()
}
