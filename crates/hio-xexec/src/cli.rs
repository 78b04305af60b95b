use clap::Parser;

/// HIO exercise driver: writes a dataset across an in-process rank group,
/// reads it back, and verifies every byte.
#[derive(Parser, Debug, Clone)]
#[command(name = "xexec", about = "HIO dataset exercise driver")]
pub struct CliArgs {
    /// Context name
    #[arg(short = 'n', long = "name", default_value = "xexec")]
    pub name: String,

    /// Colon-separated data roots (transparent fallback order)
    #[arg(short = 'p', long = "data-roots")]
    pub data_roots: String,

    /// Dataset name
    #[arg(short = 'o', long = "dataset", default_value = "ckpt")]
    pub dataset: String,

    /// Dataset id
    #[arg(short = 'I', long = "id", default_value_t = 1)]
    pub id: i64,

    /// Dataset mode (unique | shared)
    #[arg(short = 'm', long = "mode", default_value = "unique")]
    pub mode: String,

    /// File mode (basic | optimized)
    #[arg(short = 'f', long = "file-mode", default_value = "optimized")]
    pub file_mode: String,

    /// Stripe block size (supports k/m/g suffixes)
    #[arg(short = 'b', long = "block-size", default_value = "64k")]
    pub block_size: String,

    /// Request buffer size (supports k/m/g suffixes)
    #[arg(short = 'B', long = "buffer-size", default_value = "1m")]
    pub buffer_size: String,

    /// Number of ranks in the group
    #[arg(short = 'N', long = "ranks", default_value_t = 2)]
    pub ranks: i32,

    /// Ranks per node (on-node aggregation sub-groups)
    #[arg(long = "ranks-per-node", default_value_t = 2)]
    pub ranks_per_node: i32,

    /// Elements per rank
    #[arg(short = 'E', long = "elements", default_value_t = 2)]
    pub elements: usize,

    /// Bytes written per element per rank (supports k/m/g suffixes)
    #[arg(short = 's', long = "write-size", default_value = "16k")]
    pub write_size: String,

    /// Verbosity 0..5
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Abort after this many verification failures (0 = never)
    #[arg(short = 'q', long = "quit-on-fail", default_value_t = 0)]
    pub quit_on_fail: usize,

    /// Keep the dataset instead of unlinking it at the end
    #[arg(short = 'k', long = "keep")]
    pub keep: bool,
}

/// Parse a size string with optional k/m/g suffix (case-insensitive).
pub fn parse_size(s: &str) -> u64 {
    let s = s.trim();
    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    num_str
        .trim()
        .parse::<u64>()
        .unwrap_or_else(|_| panic!("invalid size: {s}"))
        * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), 1024);
        assert_eq!(parse_size("4k"), 4096);
        assert_eq!(parse_size("64K"), 65_536);
        assert_eq!(parse_size("1m"), 1_048_576);
        assert_eq!(parse_size("2g"), 2_147_483_648);
    }
}
