//! `deskmail test-inbox` — run connection diagnostics from a JSON file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use deskmail_channels::diagnostics::{test_connection, TestRequest};

use crate::helpers;

fn load_request(file: &Path, test_email: Option<String>) -> Result<TestRequest> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut req: TestRequest = serde_json::from_str(&raw)
        .with_context(|| format!("invalid test file {}", file.display()))?;
    if test_email.is_some() {
        req.test_email = test_email;
    }
    if req.imap.is_none() && req.smtp.is_none() {
        bail!("{} has neither an `imap` nor an `smtp` section", file.display());
    }
    Ok(req)
}

pub async fn run(file: &Path, test_email: Option<String>) -> Result<()> {
    let req = load_request(file, test_email)?;
    let resp = test_connection(&req).await;

    println!();
    if req.imap.is_some() {
        helpers::print_step_log("IMAP", &resp.imap_logs);
    }
    if req.smtp.is_some() {
        helpers::print_step_log("SMTP", &resp.smtp_logs);
    }

    if !resp.success {
        println!("  {} {}", "✗".red(), "Connection test failed".red().bold());
        bail!("connection test failed");
    }
    println!("  {} {}", "✓".green(), "All checks passed".green().bold());
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_file_test_email() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.json");
        std::fs::write(
            &file,
            r#"{ "smtp": { "host": "smtp.acme.io", "port": 587 }, "test_email": "a@acme.io" }"#,
        )
        .unwrap();

        let req = load_request(&file, None).unwrap();
        assert_eq!(req.test_email.as_deref(), Some("a@acme.io"));
        assert_eq!(req.smtp.unwrap().port, 587);

        let req = load_request(&file, Some("b@acme.io".into())).unwrap();
        assert_eq!(req.test_email.as_deref(), Some("b@acme.io"));
    }

    #[test]
    fn empty_request_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.json");
        std::fs::write(&file, "{}").unwrap();
        assert!(load_request(&file, None).is_err());
    }
}
