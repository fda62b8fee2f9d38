//! Presents rejection diagnostics through the log.

use modlink_core::Diagnostic;

/// Full text shown for a rejected connection: the report, then both module lists.
pub fn describe(d: &Diagnostic) -> String {
    let mut out = d.report.render();
    out.push_str("\nLocal modules:\n");
    out.push_str(&d.local.format_modules_with_policy());
    match &d.remote {
        Some(remote) => {
            out.push_str("\nRemote modules:\n");
            out.push_str(&remote.format_modules_with_policy());
        }
        None => out.push_str("\nRemote sent no module inventory.\n"),
    }
    out
}

pub fn present(d: &Diagnostic) {
    tracing::warn!(peer = %d.peer, "connection rejected\n{}", describe(d));
}
