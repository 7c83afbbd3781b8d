//! Read-only queries over a certificate store, backing the `stats`,
//! `recent`, `search` and `get` subcommands.

use crate::cli::Command;
use crate::core::CertificateStore;
use crate::formatting;
use crate::store::DomainPattern;
use anyhow::{bail, Result};

/// Rendered output of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutput {
    pub text: String,
    /// False when the query asked for something that does not exist.
    pub found: bool,
}

impl QueryOutput {
    fn found(text: String) -> Self {
        Self { text, found: true }
    }
}

/// Runs a query subcommand against `store`.
pub async fn execute(
    store: &dyn CertificateStore,
    command: &Command,
    json: bool,
) -> Result<QueryOutput> {
    let output = match command {
        Command::Stats => {
            let stats = store.stats().await?;
            QueryOutput::found(if json {
                formatting::stats_to_json(&stats)?
            } else {
                formatting::format_stats(&stats)
            })
        }
        Command::Recent { limit } => {
            let records = store.list_recent(*limit).await?;
            QueryOutput::found(if json {
                formatting::records_to_json(&records)?
            } else {
                formatting::format_records_table(&records)
            })
        }
        Command::Search { pattern, limit } => {
            let pattern = DomainPattern::new(pattern)?;
            let records = store.search(&pattern, Some(*limit)).await?;
            if json {
                QueryOutput::found(formatting::records_to_json(&records)?)
            } else if records.is_empty() {
                QueryOutput {
                    text: format!("No results found for '{}'", pattern.as_str()),
                    found: false,
                }
            } else {
                let details = records
                    .iter()
                    .map(formatting::format_record_detail)
                    .collect::<Result<Vec<_>, _>>()?;
                QueryOutput::found(details.join("\n\n"))
            }
        }
        Command::Get { domain } => match store.get(domain).await? {
            Some(record) => QueryOutput::found(if json {
                formatting::record_to_json(&record)?
            } else {
                formatting::format_record_detail(&record)?
            }),
            None => QueryOutput {
                text: format!("No record for '{domain}'"),
                found: false,
            },
        },
        Command::Ingest { .. } => bail!("ingest is not a query"),
    };
    Ok(output)
}
