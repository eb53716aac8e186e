//! # CLI - Tidepool Interactive Shell
//!
//! A REPL over a local cluster: every replica of one shard runs in this
//! process, each next to its own consensus node. Reads commands from stdin,
//! prints results to stdout, logs to stderr. Works interactively or with
//! commands piped in.
//!
//! ## Commands
//!
//! ```text
//! CREATE t col:type,... [KEY c,..] [PARTITION col[/width]] [ENGINE e] [ON r1,..]
//! ALTER t ...                 same syntax, new engine or replica list
//! INSERT t v1,v2 [v1,v2 ...]  write rows through the current replica
//! SCAN t [start] [end]        inclusive range on the first key column
//! MERGE t                     merge until nothing is left (on the leader)
//! SYNC                        let every replica catch up with the log
//! DROP t partition            drop every part of a partition
//! GC t                        delete outdated parts
//! RETRY t / SKIP t            act on the current replica's failed entry
//! HEALTH t                    JSON health report per replica
//! USE n | STOP n | START n    pick, stop or restart replica n
//! TICK [n]                    advance consensus time
//! TABLES | STATS | EXIT
//! ```
//!
//! Engines: `plain`, `dedup(ver)`, `sum(c1,c2)`, `collapse(sign)`.
//!
//! ## Configuration
//!
//! `TIDEPOOL_*` environment variables, see the `config` crate. Log level
//! comes from `RUST_LOG` (default `warn`).
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! Tidepool started (replicas=3, shard=01, data=data, leader=Some(1))
//! > CREATE hits id:int,n:int ENGINE sum(n)
//! OK
//! > INSERT hits 1,5 2,1
//! OK all_1_1_0
//! > INSERT hits 1,2
//! OK all_2_2_0
//! > MERGE hits
//! OK (1 merges on r1)
//! > SCAN hits
//! 1, 7
//! 2, 1
//! (2 rows)
//! > EXIT
//! bye
//! ```

mod shell;

use anyhow::Result;
use config::ClusterConfig;
use replication::LocalCluster;
use shell::{Flow, Shell};
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let config = ClusterConfig::from_env();
    let cluster = LocalCluster::start(config.clone())?;
    println!(
        "Tidepool started (replicas={}, shard={}, data={}, leader={:?})",
        config.replicas,
        config.shard,
        config.data_dir.display(),
        cluster.network().leader()
    );
    println!("Commands: CREATE | ALTER | INSERT | SCAN | MERGE | SYNC | DROP | GC | HEALTH");
    println!("          RETRY | SKIP | USE | STOP | START | TICK | TABLES | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let mut shell = Shell::new(cluster);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if shell.execute(&line, &mut stdout)? == Flow::Exit {
            break;
        }
        print!("> ");
        stdout.flush().ok();
    }

    Ok(())
}
