//! Command line of the image validation tool.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use clap::{ArgAction, Parser};
use log::LevelFilter;

#[derive(Default, Parser, Debug)]
#[command(about = "Checks a DPAA2 MC firmware, DPC and DPL image set against a platform configuration")]
pub struct CommandLine {
    #[arg(short, long, help = "File path of the platform configuration JSON (defaults are used if omitted)")]
    pub config: Option<String>,

    #[arg(short, long, help = "File path of the MC firmware FIT image")]
    pub firmware: Option<String>,

    #[arg(short, long, help = "File path of the DPC blob")]
    pub dpc: Option<String>,

    #[arg(short = 'l', long, help = "File path of the DPL blob")]
    pub dpl: Option<String>,

    #[arg(short, long, help = "Directory to write the fixed-up DPC and DPL to")]
    pub out_dir: Option<String>,

    #[arg(short, long, help = "Print the report as JSON")]
    pub json: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Increase log verbosity (-v info, -vv debug, -vvv trace)")]
    pub verbose: u8,
}

impl CommandLine {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_images_and_verbosity() {
        let args =
            CommandLine::try_parse_from(["dpaa2_image_validator", "--dpc", "dpc.dtb", "-l", "dpl.dtb", "-vv"]).unwrap();
        assert_eq!(args.dpc.as_deref(), Some("dpc.dtb"));
        assert_eq!(args.dpl.as_deref(), Some("dpl.dtb"));
        assert_eq!(args.firmware, None);
        assert!(!args.json);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        assert_eq!(CommandLine::default().log_level(), LevelFilter::Warn);
    }
}
