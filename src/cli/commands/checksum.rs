//! Checksum command - print the checksum of files

use crate::checksum::Checksum;
use crate::cli::args::ChecksumArgs;
use crate::error::{CommuneError, CommuneResult};
use tokio::fs;

/// Execute the checksum command
pub async fn execute(args: ChecksumArgs) -> CommuneResult<()> {
    for path in &args.files {
        let buffer = fs::read(path)
            .await
            .map_err(|e| CommuneError::io(format!("reading {}", path.display()), e))?;
        println!("{}  {}", Checksum::digest(&buffer), path.display());
    }
    Ok(())
}
