//! Log subscriber setup.
//!
//! Verbosity only picks the default filter and format; `RUST_LOG` replaces
//! the filter entirely when set.
use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Filter directives for a `-v` count.
///
/// The HTTP client stays at `error` until `-vvv`, so plain debugging output
/// is not drowned in connection chatter.
pub fn default_directives(verbosity: u8) -> String {
    let crate_level = if verbosity >= 2 { "debug" } else { "info" };
    let http_level = match verbosity {
        0..=2 => "error",
        3 => "info",
        _ => "debug",
    };
    format!(
        "warn,{}={crate_level},ureq={http_level}",
        env!("CARGO_CRATE_NAME")
    )
}

/// Install the global subscriber. Logs go to stderr.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    if verbosity == 0 {
        builder.compact().with_target(false).init();
    } else {
        builder.with_target(true).with_line_number(true).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_then_http_client_levels() {
        let crate_name = env!("CARGO_CRATE_NAME");
        assert_eq!(
            default_directives(0),
            format!("warn,{crate_name}=info,ureq=error")
        );
        assert_eq!(
            default_directives(2),
            format!("warn,{crate_name}=debug,ureq=error")
        );
        assert_eq!(
            default_directives(3),
            format!("warn,{crate_name}=debug,ureq=info")
        );
        assert_eq!(
            default_directives(9),
            format!("warn,{crate_name}=debug,ureq=debug")
        );
    }

    #[test]
    fn directives_parse() {
        for verbosity in 0..5 {
            assert!(EnvFilter::try_new(default_directives(verbosity)).is_ok());
        }
    }
}
