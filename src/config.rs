//! Ambient CLI config: `<program> [<port> [<cache_size>]]`.
//!
//! Grounded on `oxidb-server/src/main.rs`'s startup option parsing,
//! reworked from environment variables to positional CLI arguments per
//! spec.md §6, and on `original_source/python/aiomemq.py`'s `sys.argv`
//! handling for the exit-1-on-bad-argc behavior.

pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_CACHE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub port: u16,
    pub cache_size: usize,
}

impl Config {
    /// Parse `args` (not including the program name). Returns `None` on
    /// any invalid invocation: too many arguments, or an argument that
    /// fails to parse as its expected integer type.
    pub fn from_args(args: &[String]) -> Option<Config> {
        match args {
            [] => Some(Config {
                port: DEFAULT_PORT,
                cache_size: DEFAULT_CACHE_SIZE,
            }),
            [port] => {
                let port = port.parse().ok()?;
                Some(Config {
                    port,
                    cache_size: DEFAULT_CACHE_SIZE,
                })
            }
            [port, cache_size] => {
                let port = port.parse().ok()?;
                let cache_size = cache_size.parse().ok()?;
                Some(Config { port, cache_size })
            }
            _ => None,
        }
    }
}
