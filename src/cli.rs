use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::fetch::{DEFAULT_MIRRORS, FetchOptions};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the current metrics and print them without touching any file
    Fetch {
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Fetch the current metrics and rewrite the target page in place
    Update {
        /// HTML file whose citation summary and chart region get rewritten
        #[arg(value_name = "FILE")]
        target: PathBuf,

        #[command(flatten)]
        profile: ProfileArgs,

        /// Maximum tolerated size change between old and new document, in
        /// percent; a rewrite at or above this is refused as likely corruption
        #[arg(long, value_name = "PCT", default_value_t = 2.0)]
        safety_threshold: f64,
    },
}

#[derive(Args, Debug)]
pub struct ProfileArgs {
    /// Profile identifier (the `user` query parameter)
    #[arg(short, long, value_name = "ID")]
    pub user: String,

    /// Interface language (the `hl` query parameter)
    #[arg(long, value_name = "LC", default_value = "en")]
    pub lang: String,

    /// Mirror host to try; repeat to set the fallback order. Defaults to the
    /// stock hosts when omitted
    #[arg(long = "mirror", value_name = "HOST")]
    pub mirrors: Vec<String>,

    /// Upper bound in seconds for the randomized pre-request delay; 0 disables
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub max_delay: u64,
}

impl ProfileArgs {
    pub fn to_options(&self) -> FetchOptions {
        let mirrors = if self.mirrors.is_empty() {
            DEFAULT_MIRRORS.iter().map(|s| s.to_string()).collect()
        } else {
            self.mirrors.clone()
        };
        FetchOptions {
            user: self.user.clone(),
            lang: self.lang.clone(),
            mirrors,
            max_delay: self.max_delay,
        }
    }
}
