use super::Parser;

#[derive(Parser, Debug)]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,
    /// Handle to sign in as.
    #[arg(long, default_value = "alice")]
    pub user: String,
    /// Handle of the conversation partner opened at start.
    #[arg(long, default_value = "bob")]
    pub partner: String,
}
