//! Error handling and display for the CLI.

use colored::Colorize;
use mjobs_store::StoreError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Job not found: {0}")]
    NotFound(String),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(CliError::NotFound(_)) = err.downcast_ref::<CliError>() {
        eprintln!(
            "\n{}",
            "Hint: Run `mjobs queue` to list known jobs.".yellow()
        );
        return;
    }

    let Some(store_err) = err.chain().find_map(|e| e.downcast_ref::<StoreError>()) else {
        return;
    };
    match store_err {
        StoreError::AmbiguousName { ids, .. } => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            eprintln!(
                "\n{}",
                format!("Hint: Cancel by job id instead: `mjobs cancel {}`.", ids.join(" ")).yellow()
            );
        }
        StoreError::NotFound(_) | StoreError::NameNotFound(_) => {
            eprintln!(
                "\n{}",
                "Hint: Run `mjobs queue` to list known jobs.".yellow()
            );
        }
        StoreError::Sqlite(_) | StoreError::NoDataDir => {
            eprintln!(
                "\n{}",
                "Hint: Check --data-dir or MJOBS_DATA_DIR points at the scheduler's data directory."
                    .yellow()
            );
        }
        _ => {}
    }
}
