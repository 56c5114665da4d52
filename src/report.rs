use std::fmt::Write;

use chrono::Utc;

use crate::models::RiskLevel;
use crate::risk::ProfileSummary;

pub fn level_counts(summaries: &[ProfileSummary]) -> (usize, usize, usize) {
    let mut none = 0;
    let mut at_risk = 0;
    let mut critical = 0;
    for summary in summaries {
        match summary.profile.risk_level {
            RiskLevel::None => none += 1,
            RiskLevel::AtRisk => at_risk += 1,
            RiskLevel::Critical => critical += 1,
        }
    }
    (none, at_risk, critical)
}

pub fn build_report(summaries: &[ProfileSummary]) -> String {
    let (none, at_risk, critical) = level_counts(summaries);

    let mut output = String::new();
    let _ = writeln!(output, "# Student Risk Report");
    let _ = writeln!(
        output,
        "Generated {} ({} profiles)",
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
        summaries.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");
    let _ = writeln!(output, "- critical: {critical}");
    let _ = writeln!(output, "- at-risk: {at_risk}");
    let _ = writeln!(output, "- no risk: {none}");

    for level in [RiskLevel::Critical, RiskLevel::AtRisk] {
        let matching: Vec<_> = summaries
            .iter()
            .filter(|s| s.profile.risk_level == level)
            .collect();

        let _ = writeln!(output);
        let _ = writeln!(output, "## {} students", level);

        if matching.is_empty() {
            let _ = writeln!(output, "None.");
            continue;
        }

        for summary in matching {
            let _ = writeln!(
                output,
                "- {} ({}) attendance {}%, test average {}%",
                summary.student_name,
                summary.student_email,
                summary.profile.attendance_percentage,
                summary.profile.test_average
            );
            for factor in &summary.profile.factors {
                let _ = writeln!(output, "  - {}", factor.description);
            }
        }
    }

    output
}
