//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::pool::{
    AddReport, AllocationOutcome, AllocationState, DeallocationReport, Node, RemoveReport,
    TypeSummary, WarningSeverity,
};
use crate::server::OperationStatus;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

// ============================================================================
// Node display
// ============================================================================

pub fn format_node_list(nodes: &[Node]) -> String {
    let headers = &["ID", "TYPE", "HOST", "SIMULATION", "OWNERS", "EXCLUSIVE"];
    let rows = nodes
        .iter()
        .map(|node| {
            vec![
                node.id.clone(),
                node.node_type.clone(),
                node.host.clone(),
                node.simulation.clone().unwrap_or_else(|| "-".to_string()),
                node.holders(),
                if node.exclusive { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_summary(summary: &[TypeSummary]) -> String {
    let headers = &["TYPE", "TOTAL", "USED", "EXCLUSIVE", "AVAILABLE"];
    let rows = summary
        .iter()
        .map(|row| {
            vec![
                row.node_type.clone(),
                row.total.to_string(),
                row.used.to_string(),
                row.exclusive.to_string(),
                row.available.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

// ============================================================================
// Inventory reports
// ============================================================================

pub fn format_add_report(report: &AddReport) -> String {
    let mut output = format!("Added {} node(s)\n", report.added.len());
    for (reason, ids) in &report.rejected {
        output.push_str(&format!("  Rejected ({}): {}\n", reason, ids.join(", ")));
    }
    output
}

pub fn format_remove_report(report: &RemoveReport) -> String {
    let mut output = format!("Removed {} node(s)\n", report.removed.len());
    if !report.allocated.is_empty() {
        output.push_str(&format!(
            "  Still allocated (use --force): {}\n",
            report.allocated.join(", ")
        ));
    }
    if !report.missing.is_empty() {
        output.push_str(&format!("  Not found: {}\n", report.missing.join(", ")));
    }
    output
}

pub fn format_status(status: &OperationStatus) -> String {
    let mut output = status.message.clone();
    if let Some(count) = status
        .details
        .as_ref()
        .and_then(|d| d.get("nodes"))
        .and_then(|n| n.as_u64())
    {
        output.push_str(&format!(" ({} node(s))", count));
    }
    output.push('\n');
    output
}

// ============================================================================
// Allocation display
// ============================================================================

pub fn format_outcome(outcome: &AllocationOutcome) -> String {
    let state = match outcome.state {
        AllocationState::Satisfied => "SATISFIED",
        AllocationState::Partial => "PARTIAL",
    };
    let mut output = format!(
        "Consumer: {}\nState:    {}\nNodes:    {}\n\n",
        outcome.consumer,
        state,
        outcome.total()
    );

    let headers = &["TYPE", "COUNT", "NODES"];
    let rows = outcome
        .nodes
        .iter()
        .map(|(node_type, nodes)| {
            let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
            vec![node_type.clone(), nodes.len().to_string(), join_or_dash(&ids)]
        })
        .collect();
    output.push_str(&format_table(headers, rows));

    if !outcome.warnings.is_empty() {
        output.push_str("\nWarnings:\n");
        for warning in &outcome.warnings {
            let tag = match warning.severity {
                WarningSeverity::Warning => "warn",
                WarningSeverity::EnvironmentError => "ERROR",
            };
            output.push_str(&format!("  [{}] {}\n", tag, warning.message));
        }
    }
    output
}

pub fn format_deallocation(report: &DeallocationReport) -> String {
    let mut output = format!(
        "Released {} node(s) from {}\n",
        report.released.len(),
        report.consumer
    );
    if !report.failed.is_empty() {
        output.push_str(&format!("  Failed: {}\n", report.failed.join(", ")));
    }
    output
}
