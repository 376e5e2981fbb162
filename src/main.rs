use anyhow::Result;
use tracing::{error, info};

mod admission;
mod cli;
mod dispatcher;
mod executor;
mod gateway;
mod protocol;
mod storage;
mod utils;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    utils::init_logging(args.verbose, args.log_file.clone())?;
    info!("Starting pagegate v{}", env!("CARGO_PKG_VERSION"));

    let runtime = args.runtime()?;

    // Process commands
    match runtime.block_on(cli::process_command(args)) {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
