// Human-readable rendering of status snapshots for the CLI.

use speedtest_common::{StatusSnapshot, TestPhase};

fn value(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.2}", v),
        None => "-".to_string(),
    }
}

fn phase_name(phase: TestPhase) -> &'static str {
    match phase {
        TestPhase::NOT_STARTED => "waiting",
        TestPhase::STARTING => "starting",
        TestPhase::DOWNLOAD => "download",
        TestPhase::PING => "ping",
        TestPhase::UPLOAD => "upload",
        TestPhase::FINISHED => "finished",
        TestPhase::ABORTED => "aborted",
        _ => "unknown",
    }
}

/// One status line, rewritten in place while a run is active.
pub fn format_progress(snapshot: &StatusSnapshot) -> String {
    let (label, progress) = match snapshot.test_state {
        TestPhase::DOWNLOAD => ("download", snapshot.dl_progress),
        TestPhase::PING => ("ping", snapshot.ping_progress),
        TestPhase::UPLOAD => ("upload", snapshot.ul_progress),
        other => (phase_name(other), 0.0),
    };
    format!(
        "[{:<8}] {:>3.0}%  dl {} Mbit/s  ul {} Mbit/s  ping {} ms  jitter {} ms",
        label,
        progress.clamp(0.0, 1.0) * 100.0,
        value(snapshot.dl_status),
        value(snapshot.ul_status),
        value(snapshot.ping_status),
        value(snapshot.jitter_status),
    )
}

/// Final result table.
pub fn format_summary(snapshot: &StatusSnapshot, aborted: bool) -> String {
    let mut lines = Vec::with_capacity(7);
    lines.push(format!(
        "Result:    {}",
        if aborted { "aborted" } else { "completed" }
    ));
    if !snapshot.client_ip.is_empty() {
        lines.push(format!("Client:    {}", snapshot.client_ip));
    }
    lines.push(format!("Download:  {} Mbit/s", value(snapshot.dl_status)));
    lines.push(format!("Upload:    {} Mbit/s", value(snapshot.ul_status)));
    lines.push(format!("Ping:      {} ms", value(snapshot.ping_status)));
    lines.push(format!("Jitter:    {} ms", value(snapshot.jitter_status)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_shows_active_phase() {
        let snapshot = StatusSnapshot {
            test_state: TestPhase::DOWNLOAD,
            dl_status: Some(93.456),
            dl_progress: 0.5,
            ..StatusSnapshot::default()
        };
        let line = format_progress(&snapshot);
        assert!(line.starts_with("[download]  50%"));
        assert!(line.contains("dl 93.46 Mbit/s"));
        assert!(line.contains("ul - Mbit/s"));
    }

    #[test]
    fn summary_of_aborted_run_marks_missing_values() {
        let snapshot = StatusSnapshot {
            test_state: TestPhase::ABORTED,
            ping_status: Some(12.0),
            jitter_status: Some(1.25),
            client_ip: "203.0.113.7 - Example ISP".to_string(),
            ..StatusSnapshot::default()
        };
        let summary = format_summary(&snapshot, true);
        assert_eq!(
            summary,
            "Result:    aborted\n\
             Client:    203.0.113.7 - Example ISP\n\
             Download:  - Mbit/s\n\
             Upload:    - Mbit/s\n\
             Ping:      12.00 ms\n\
             Jitter:    1.25 ms"
        );
    }
}
