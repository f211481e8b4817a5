//! Structures and methods for collecting and reporting validation results.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::validation_kind::PrettyPrintTable;
use colored::*;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::validation_kind::ValidationKind;

#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct ValidationReport {
    // Group name to the violations of that group
    report: BTreeMap<String, Vec<ValidationKind>>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self { report: BTreeMap::new() }
    }

    pub fn add_violation(&mut self, validation: ValidationKind) {
        let group_name = validation.name();
        self.report.entry(group_name).or_default().push(validation);
    }

    /// Merges `validation_report` into this one, keeping violations of groups present in both.
    pub fn append_report(&mut self, validation_report: ValidationReport) {
        for (group_name, mut violations) in validation_report.report {
            self.report.entry(group_name).or_default().append(&mut violations);
        }
    }

    pub fn violation_count(&self) -> usize {
        self.report.values().map(Vec::len).sum()
    }

    #[cfg(test)]
    pub fn violations(&self, group_name: &str) -> &[ValidationKind] {
        self.report.get(group_name).map_or(&[], Vec::as_slice)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn show_results(&self) {
        if self.report.is_empty() {
            println!("No violations found.");
        } else {
            self.pretty_print();
        }
    }

    fn pretty_print(&self) {
        println!("{}", "Validation Results:".red().bold());
        for violations in self.report.values() {
            let Some(first) = violations.first() else {
                continue;
            };

            println!("──────────────────────────────────────────────────────────────────");
            println!("❌ {}", first.header().green().bold());
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(first.table_header());

            for (j, violation) in violations.iter().enumerate() {
                table.add_row(violation.table_row((j + 1).to_string()));
            }

            println!("{table}");
            println!("💡 {}", format!("Guidance:\n{}", first.guidance()).blue().bold());
        }
    }
}
