//! Built-in path and secret patterns for the output gate.

/// Locations generated output must never be written to, whatever the allowlist says.
pub const FORBIDDEN_PATHS: &[&str] = &[
    r"^/etc/",
    r"^/usr/",
    r"^/var/",
    r"^/root/",
    r"^~/",
    r"(^|/)node_modules/",
    r"(^|/)\.git/",
    r"(^|/)\.venv/",
    r"(^|/)\.env($|\.)",
    r"(^|/)package\.json$",
    r"(^|/)package-lock\.json$",
    r"(^|/)yarn\.lock$",
    r"(^|/)pnpm-lock\.yaml$",
    r"(^|/)Cargo\.lock$",
];

/// Roots generated output may be written under.
pub const ALLOWED_PATHS: &[&str] = &[
    r"^src/",
    r"^tests/",
    r"^docs/",
    r"^frontend/",
    r"^backend/",
    r"^\.hitl/output/",
    r"^\.hitl/logs/",
];

/// Secret-shaped tokens, tagged with the marker kind used when masking.
///
/// Order matters: the Anthropic key shape also matches the generic `sk-`
/// prefix, so it is masked first.
pub const SECRET_PATTERNS: &[(&str, &str)] = &[
    ("ANTHROPIC_KEY", r"sk-ant-[a-zA-Z0-9_-]{8,}"),
    ("OPENAI_KEY", r"sk-(?:proj-)?[a-zA-Z0-9]{32,}"),
    ("GOOGLE_KEY", r"AIza[a-zA-Z0-9_-]{35}"),
    ("GITHUB_TOKEN", r"gh[pousr]_[a-zA-Z0-9]{36}"),
    ("PRIVATE_KEY", r"-----BEGIN (?:RSA |EC |OPENSSH |)PRIVATE KEY-----"),
    (
        "PASSWORD",
        r#"(?i)password\s*[:=]\s*["'][^"']{4,}["']"#,
    ),
    ("CARD_NUMBER", r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"),
];
