//! Security invariant tests for the payment channel crates.
//!
//! These scan production sources on every `cargo test --workspace` run so
//! that a refactor cannot silently drop a settlement or signature check.

use regex::Regex;
use std::path::Path;
use walkdir::WalkDir;

/// Read all .rs source files from production crates (excluding tests and this crate).
fn production_source_files() -> Vec<(String, String)> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap();

    let crates_dir = root.join("crates");
    let mut files = Vec::new();

    for entry in WalkDir::new(&crates_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }

        let path_str = path.to_str().unwrap_or("");
        if path_str.contains("security-audit") {
            continue;
        }
        if path_str.contains("tests/") || path_str.contains("\\tests\\") {
            continue;
        }

        if let Ok(content) = std::fs::read_to_string(path) {
            files.push((path_str.to_string(), content));
        }
    }

    files
}

/// Lines outside `#[cfg(test)]` modules, with comment lines dropped.
/// Heuristic: everything after the first `#[cfg(test)]` is treated as test code.
fn production_lines(content: &str) -> String {
    let mut result = Vec::new();

    for line in content.lines() {
        if line.contains("#[cfg(test)]") || line.trim().starts_with("mod tests") {
            break;
        }
        if line.trim_start().starts_with("//") {
            continue;
        }
        result.push(line);
    }

    result.join("\n")
}

/// Body of `fn name` up to the next top-level or impl-level `fn`.
fn function_body<'a>(content: &'a str, name: &str) -> Option<&'a str> {
    let start = content.find(&format!("fn {name}"))?;
    let body = &content[start..];
    let end = body[1..]
        .find("\n    fn ")
        .or_else(|| body[1..].find("\n    pub fn "))
        .or_else(|| body[1..].find("\nfn "))
        .or_else(|| body[1..].find("\npub fn "))
        .map(|i| i + 1)
        .unwrap_or(body.len());
    Some(&body[..end])
}

fn source_named<'a>(files: &'a [(String, String)], suffix: &str) -> Option<&'a str> {
    files
        .iter()
        .find(|(path, _)| path.ends_with(suffix))
        .map(|(_, content)| content.as_str())
}

#[test]
fn no_hardcoded_private_keys_in_production_code() {
    let hex_64_re = Regex::new(r"0x[a-fA-F0-9]{64}").unwrap();
    let files = production_source_files();

    let allowed_patterns = ["SECP256K1_N_DIV_2"];

    for (path, content) in &files {
        let prod_content = production_lines(content);

        for mat in hex_64_re.find_iter(&prod_content) {
            let line_num = prod_content[..mat.start()].lines().count() + 1;
            let line = prod_content.lines().nth(line_num - 1).unwrap_or("");

            let context_start = mat.start().saturating_sub(200);
            let context_end = (mat.end() + 200).min(prod_content.len());
            let context = &prod_content[context_start..context_end];

            assert!(
                allowed_patterns.iter().any(|p| context.contains(p)),
                "Potential hardcoded secret found at {}:{}: {}",
                path,
                line_num,
                line.trim()
            );
        }
    }
}

#[test]
fn signature_recovery_rejects_high_s() {
    let files = production_source_files();
    let eip712 = source_named(&files, "eip712.rs").expect("eip712.rs not found");
    let prod = production_lines(eip712);

    let recover = function_body(&prod, "recover_payment_signer")
        .expect("recover_payment_signer not found");
    assert!(
        recover.contains("SECP256K1_N_DIV_2"),
        "recover_payment_signer must reject signatures with s > n/2 (EIP-2 malleability)"
    );
    assert!(
        recover.contains("SignatureError::HighS"),
        "high-s signatures must surface as SignatureError::HighS"
    );
}

#[test]
fn settlement_is_claimed_before_funds_move() {
    let files = production_source_files();
    let channel = source_named(&files, "channel.rs").expect("channel.rs not found");
    let prod = production_lines(channel);

    let settle = function_body(&prod, "settle").expect("settle not found");
    let claim = settle
        .find("compare_exchange(")
        .expect("settle must claim the settlement with a compare-and-swap");
    let claimed_state = &settle[claim..];
    assert!(
        claimed_state.contains("ACTIVE,") && claimed_state.contains("SETTLING,"),
        "settle must move ACTIVE -> SETTLING before paying out"
    );
    let disburse = settle
        .find("disburse_escrow")
        .expect("settle must pay out through disburse_escrow");
    assert!(
        claim < disburse,
        "settlement must be claimed before the ledger is called (re-entrancy guard)"
    );

    // Nothing else may move escrow around the guard.
    let disburse_calls = prod.matches(".disburse(").count();
    assert_eq!(
        disburse_calls, 1,
        "channel.rs must call ledger.disburse exactly once, inside disburse_escrow"
    );
    let escrow_fn = function_body(&prod, "disburse_escrow").expect("disburse_escrow not found");
    assert!(escrow_fn.contains(".disburse("));
}

#[test]
fn close_and_cancel_go_through_settle() {
    let files = production_source_files();
    let channel = source_named(&files, "channel.rs").expect("channel.rs not found");
    let prod = production_lines(channel);

    for name in ["close", "cancel"] {
        let body = function_body(&prod, name).unwrap_or_else(|| panic!("fn {name} not found"));
        assert!(
            body.contains("self.active_terms()?"),
            "{name} must check channel status first"
        );
        assert!(body.contains("self.settle("), "{name} must settle through the guard");
        assert!(
            !body.contains("self.ledger."),
            "{name} must not touch the ledger outside settle"
        );
    }
}

#[test]
fn no_unwrap_in_library_code() {
    let unwrap_re = Regex::new(r"\.unwrap\(\)|\.expect\(").unwrap();
    let files = production_source_files();

    for (path, content) in &files {
        // Binaries may abort on bad configuration.
        if path.contains("/bin/") || path.contains("\\bin\\") {
            continue;
        }
        let prod_content = production_lines(content);

        for (idx, line) in prod_content.lines().enumerate() {
            assert!(
                !unwrap_re.is_match(line),
                "unwrap()/expect() in library code at {}:{}: {}. Propagate the error instead.",
                path,
                idx + 1,
                line.trim()
            );
        }
    }
}

#[test]
fn event_log_sqlite_available_in_demo() {
    let files = production_source_files();

    for (path, content) in &files {
        if !path.contains("channel-demo.rs") {
            continue;
        }
        assert!(
            content.contains("SqliteEventLog"),
            "channel-demo at {} should offer SqliteEventLog for a persistent event log",
            path
        );
    }
}
