//! 文件名与客户端地址清洗。

use regex::Regex;
use std::sync::LazyLock;

static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9\s\-_~,;:\[\]\(\).]").expect("disallowed-character pattern")
});

static DOT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.{2,}").expect("dot-run pattern"));

/// 移除允许字符集之外的字符，再删除连续两个及以上的 `.`。
pub fn sanitize(input: &str) -> String {
    let stripped = DISALLOWED.replace_all(input, "");
    DOT_RUN.replace_all(&stripped, "").into_owned()
}

/// 清洗远端地址；空地址原样返回。
pub fn sanitize_party(remote_addr: &str) -> String {
    if remote_addr.is_empty() {
        return String::new();
    }
    sanitize(remote_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowed_characters() {
        assert_eq!(sanitize("test.csv"), "test.csv");
        assert_eq!(sanitize("a-b_c~d,e;f:g[h](i) j"), "a-b_c~d,e;f:g[h](i) j");
        assert_eq!(sanitize("1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn strips_path_and_shell_characters() {
        assert_eq!(sanitize("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize("a/b\\c"), "abc");
        assert_eq!(sanitize("$(rm -rf *)|&'\"<>"), "(rm -rf )");
        assert_eq!(sanitize("résumé.pdf"), "rsum.pdf");
    }

    #[test]
    fn collapses_dot_runs_to_nothing() {
        assert_eq!(sanitize("a..b"), "ab");
        assert_eq!(sanitize("a.....b.c"), "ab.c");
        assert_eq!(sanitize(".."), "");
        assert_eq!(sanitize("..hidden"), "hidden");
        assert_eq!(sanitize(".profile"), ".profile");
    }

    #[test]
    fn stripping_can_expose_dot_runs() {
        assert_eq!(sanitize("a./.b"), "ab");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let samples = [
            "",
            "test.csv",
            "a./.b",
            "..././..//.x",
            "name with spaces (1).CSV",
            "ipv6 [::1]:443",
            "tab\tand\nnewline",
            "ünïcödé..file..",
            ". . .. ...",
        ];
        for sample in samples {
            let once = sanitize(sample);
            assert_eq!(sanitize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn output_only_contains_allowed_characters() {
        let output = sanitize("a!@#$%^&*+=?/|`'\"<>{}b..c.d");
        assert_eq!(output, "abc.d");
        assert!(output.chars().all(|c| c.is_ascii_alphanumeric()
            || c.is_whitespace()
            || "-_~,;:[]().".contains(c)));
        assert!(!output.contains(".."));
    }

    #[test]
    fn party_sanitization() {
        assert_eq!(sanitize_party(""), "");
        assert_eq!(sanitize_party("1.2.3.4"), "1.2.3.4");
        assert_eq!(sanitize_party("::ffff:10.0.0.1"), "::ffff:10.0.0.1");
        assert_eq!(sanitize_party("fe80::1%eth0"), "fe80::1eth0");
    }
}
