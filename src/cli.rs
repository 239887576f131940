use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Label to migrate from in the source account.
    pub source_label: String,

    /// Label applied to migrated messages in the destination account.
    pub destination_label: String,

    /// Restrict the migration to messages matching a Gmail search query.
    #[clap(long)]
    pub query: Option<String>,

    /// Path to the OAuth client secrets file.
    #[clap(long, default_value = "credentials.json")]
    pub secrets: PathBuf,

    /// Directory holding the per-account token files.
    #[clap(long, default_value = ".")]
    pub token_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_both_label_names() {
        assert!(Cli::try_parse_from(["mailhaul"]).is_err());
        assert!(Cli::try_parse_from(["mailhaul", "only-source"]).is_err());
        assert!(Cli::try_parse_from(["mailhaul", "a", "b", "c"]).is_err());
    }

    #[test]
    fn test_parses_labels_and_defaults() {
        let cli = Cli::try_parse_from(["mailhaul", "receipts", "receipts-merged"])
            .expect("two labels parse");
        assert_eq!(cli.source_label, "receipts");
        assert_eq!(cli.destination_label, "receipts-merged");
        assert!(cli.query.is_none());
        assert_eq!(cli.secrets, PathBuf::from("credentials.json"));
        assert_eq!(cli.token_dir, PathBuf::from("."));
    }

    #[test]
    fn test_accepts_query_and_paths() {
        let cli = Cli::try_parse_from([
            "mailhaul",
            "receipts",
            "receipts-merged",
            "--query",
            "before:2020/01/01",
            "--secrets",
            "/etc/mailhaul/credentials.json",
            "--token-dir",
            "/var/lib/mailhaul",
        ])
        .expect("flags parse");
        assert_eq!(cli.query.as_deref(), Some("before:2020/01/01"));
        assert_eq!(cli.secrets, PathBuf::from("/etc/mailhaul/credentials.json"));
        assert_eq!(cli.token_dir, PathBuf::from("/var/lib/mailhaul"));
    }
}
