pub mod fibonacci;
pub mod outbound;

use crate::app::config::WorkloadConfig;
use crate::core::correlation::fanout::Branch;
use anyhow::{Context, Error};
use reqwest::Client;
use std::time::Duration;
use url::Url;

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

struct Outbound {
    client: Client,
    url: Url,
    repeats: u32,
}

/// The concurrent work each request fans out to
pub struct Workloads {
    fibonacci_n: u32,
    outbound: Option<Outbound>,
    join_timeout: Duration,
}

impl Workloads {
    pub fn from_config(config: &WorkloadConfig) -> Result<Self, Error> {
        let outbound = match &config.outbound_url {
            Some(target) => {
                let client = Client::builder()
                    .timeout(OUTBOUND_TIMEOUT)
                    .build()
                    .context("failed to build outbound http client")?;

                Some(Outbound {
                    client,
                    url: Url::parse(target)
                        .with_context(|| format!("invalid outbound url {}", target))?,
                    repeats: config.outbound_repeats,
                })
            }
            None => None,
        };

        Ok(Workloads {
            fibonacci_n: config.fibonacci_n,
            outbound,
            join_timeout: config.join_timeout,
        })
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// Fresh branches for one request
    pub fn branches(&self) -> Vec<Branch> {
        let n = self.fibonacci_n;
        let mut branches = vec![Branch::new(fibonacci::OP_FIBONACCI, move |ctx| async move {
            fibonacci::run(ctx, n).await.map(|_| ())
        })];

        if let Some(outbound) = &self.outbound {
            let client = outbound.client.clone();
            let url = outbound.url.clone();
            let repeats = outbound.repeats;

            branches.push(Branch::new(outbound::OP_HTTP_REQ_WITH_TRACE, move |ctx| {
                outbound::run(ctx, client, url, repeats)
            }));
        }

        branches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_branch_only_when_configured() {
        let mut config = WorkloadConfig::default();
        let workloads = Workloads::from_config(&config).unwrap();
        assert_eq!(workloads.branches().len(), 1);
        assert_eq!(workloads.join_timeout(), Duration::from_secs(30));

        config.outbound_url = Some("http://127.0.0.1:9/".to_string());
        let workloads = Workloads::from_config(&config).unwrap();
        assert_eq!(workloads.branches().len(), 2);

        config.outbound_url = Some("::".to_string());
        assert!(Workloads::from_config(&config).is_err());
    }
}
