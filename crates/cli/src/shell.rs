//! Command parsing and execution for the interactive shell.

use anyhow::{anyhow, bail, ensure, Context, Result};
use replication::LocalCluster;
use rows::{Column, ColumnType, KeyRange, PartitionBy, Row, TableDef, Transform, Value};
use std::io::Write;

/// What the loop in `main` should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    cluster: LocalCluster,
    /// Replica that receives INSERT, SCAN, CREATE and DROP.
    current: u64,
}

impl Shell {
    pub fn new(cluster: LocalCluster) -> Self {
        Self { cluster, current: 1 }
    }

    /// Runs one command line, writing its output to `out`. Command failures
    /// are printed as `ERR ...`; only I/O errors on `out` are returned.
    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(Flow::Continue);
        };
        let args: Vec<&str> = parts.collect();
        let upper = cmd.to_uppercase();
        if upper == "EXIT" || upper == "QUIT" {
            writeln!(out, "bye")?;
            return Ok(Flow::Exit);
        }
        if let Err(e) = self.dispatch(&upper, &args, out) {
            writeln!(out, "ERR {} failed: {:#}", upper.to_lowercase(), e)?;
        }
        Ok(Flow::Continue)
    }

    fn dispatch<W: Write>(&mut self, cmd: &str, args: &[&str], out: &mut W) -> Result<()> {
        match cmd {
            "CREATE" => {
                let def = parse_table_def(args)?;
                self.replica()?.create_table(&def)?;
                self.cluster.sync_all()?;
                writeln!(out, "OK")?;
            }
            "ALTER" => {
                let def = parse_table_def(args)?;
                self.replica()?.alter_table(&def)?;
                writeln!(out, "OK")?;
            }
            "INSERT" => {
                let (table, rows) = args.split_first().context("usage: INSERT table v1,v2,... [v1,v2,...]")?;
                let replica = self.replica()?;
                let def = replica.store(table)?.def();
                let rows = rows
                    .iter()
                    .map(|r| parse_row(&def, r))
                    .collect::<Result<Vec<Row>>>()?;
                let parts = replica.insert(table, rows)?;
                let names: Vec<String> = parts.iter().map(ToString::to_string).collect();
                writeln!(out, "OK {}", names.join(" "))?;
            }
            "SCAN" => {
                let table = args.first().context("usage: SCAN table [start] [end]")?;
                let replica = self.replica()?;
                let def = replica.store(table)?.def();
                let range = parse_range(&def, args.get(1).copied(), args.get(2).copied())?;
                let mut n = 0;
                for row in replica.scan(table, &range)? {
                    let row = row?;
                    let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
                    writeln!(out, "{}", cells.join(", "))?;
                    n += 1;
                }
                if n == 0 {
                    writeln!(out, "(empty)")?;
                } else {
                    writeln!(out, "({} rows)", n)?;
                }
            }
            "MERGE" => {
                let table = args.first().context("usage: MERGE table")?;
                self.cluster.network().settle()?;
                let leader = self.cluster.leader().context("no leader")?;
                let merges = leader.optimize(table)?;
                writeln!(out, "OK ({} merges on {})", merges, leader.identity().replica)?;
            }
            "SYNC" => {
                let applied = self.cluster.sync_all()?;
                writeln!(out, "OK ({} entries applied)", applied)?;
            }
            "DROP" => {
                let (table, partition) = match args {
                    [t, p] => (*t, *p),
                    _ => bail!("usage: DROP table partition"),
                };
                let parts = self.replica()?.drop_partition(table, partition)?;
                writeln!(out, "OK ({} parts dropped)", parts.len())?;
            }
            "GC" => {
                let table = args.first().context("usage: GC table")?;
                let mut removed = 0;
                for replica in self.cluster.replicas() {
                    removed += replica.collect_garbage(table)?;
                }
                writeln!(out, "OK ({} parts removed)", removed)?;
            }
            "RETRY" | "SKIP" => {
                let table = args.first().context("usage: RETRY|SKIP table")?;
                let replica = self.replica()?;
                let seq = if cmd == "RETRY" {
                    replica.retry_failed(table)?
                } else {
                    replica.skip_failed(table)?
                };
                match seq {
                    Some(seq) => writeln!(out, "OK (entry {})", seq)?,
                    None => writeln!(out, "(no failed entry)")?,
                }
            }
            "HEALTH" => {
                let table = args.first().context("usage: HEALTH table")?;
                for replica in self.cluster.replicas() {
                    let health = replica.health(table)?;
                    writeln!(out, "{}", serde_json::to_string(&health)?)?;
                }
            }
            "USE" => {
                let n = parse_replica(args)?;
                ensure!(self.cluster.is_online(n), "replica {} is not running", n);
                self.current = n;
                writeln!(out, "OK (using r{})", n)?;
            }
            "STOP" => {
                let n = parse_replica(args)?;
                self.cluster.stop(n)?;
                writeln!(out, "OK")?;
            }
            "START" => {
                let n = parse_replica(args)?;
                self.cluster.restart(n)?;
                writeln!(out, "OK")?;
            }
            "TICK" => {
                let n: usize = match args.first() {
                    Some(s) => s.parse().with_context(|| format!("bad tick count '{}'", s))?,
                    None => 1,
                };
                self.cluster.network().tick_n(n)?;
                writeln!(out, "OK (leader: {:?})", self.cluster.network().leader())?;
            }
            "TABLES" => {
                let tables = self.replica()?.tables();
                if tables.is_empty() {
                    writeln!(out, "(none)")?;
                }
                for t in tables {
                    writeln!(out, "{}", t)?;
                }
            }
            "STATS" => {
                writeln!(out, "{:?}", self.cluster)?;
            }
            other => writeln!(out, "unknown command: {}", other)?,
        }
        Ok(())
    }

    fn replica(&self) -> Result<&replication::Replica> {
        self.cluster
            .replica(self.current)
            .ok_or_else(|| anyhow!("replica r{} is stopped; USE another one", self.current))
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell").field("current", &self.current).finish()
    }
}

fn parse_replica(args: &[&str]) -> Result<u64> {
    let arg = args.first().context("usage: <command> replica")?;
    arg.trim_start_matches('r')
        .parse()
        .with_context(|| format!("bad replica '{}'", arg))
}

/// `name col:type,... [KEY c1,c2] [PARTITION col | col/width] [ENGINE spec] [ON r1,r2]`
///
/// Engines: `plain`, `dedup(ver)`, `sum(c1,c2)`, `collapse(sign)`.
pub fn parse_table_def(args: &[&str]) -> Result<TableDef> {
    let [name, columns, rest @ ..] = args else {
        bail!("usage: CREATE name col:type,... [KEY cols] [PARTITION col[/width]] [ENGINE spec] [ON replicas]");
    };
    let columns = columns
        .split(',')
        .map(|c| {
            let (name, ty) = c.split_once(':').with_context(|| format!("column '{}' needs a type", c))?;
            match ty.to_lowercase().as_str() {
                "int" => Ok(Column::int(name)),
                "str" | "string" => Ok(Column::string(name)),
                other => bail!("unknown column type '{}'", other),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    let mut def = TableDef::new(*name, columns);

    ensure!(rest.len() % 2 == 0, "options come in KEYWORD value pairs");
    for pair in rest.chunks(2) {
        let value = pair[1];
        match pair[0].to_uppercase().as_str() {
            "KEY" => {
                let key: Vec<&str> = value.split(',').collect();
                def = def.with_sort_key(&key);
            }
            "PARTITION" => {
                let by = match value.split_once('/') {
                    Some((column, width)) => PartitionBy::IntDiv {
                        column: column.to_string(),
                        width: width.parse().with_context(|| format!("bad width '{}'", width))?,
                    },
                    None => PartitionBy::Column(value.to_string()),
                };
                def = def.with_partition(by);
            }
            "ENGINE" => def = def.with_transform(parse_transform(value)?),
            "GRANULE" => def = def.with_granule_rows(value.parse().context("bad granule size")?),
            "ON" => {
                let replicas: Vec<&str> = value.split(',').collect();
                def = def.with_replicas(&replicas);
            }
            other => bail!("unknown option '{}'", other),
        }
    }
    def.validate()?;
    Ok(def)
}

fn parse_transform(spec: &str) -> Result<Transform> {
    let (kind, args) = match spec.split_once('(') {
        Some((kind, rest)) => (kind, rest.strip_suffix(')').context("missing ')'")?),
        None => (spec, ""),
    };
    let args: Vec<String> = args
        .split(',')
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    Ok(match (kind.to_lowercase().as_str(), args.as_slice()) {
        ("plain", []) => Transform::Plain,
        ("dedup", [version]) => Transform::Dedup {
            version: version.clone(),
        },
        ("sum", columns) if !columns.is_empty() => Transform::Sum {
            columns: columns.to_vec(),
        },
        ("collapse", [sign]) => Transform::Collapse { sign: sign.clone() },
        _ => bail!("bad engine '{}'", spec),
    })
}

fn parse_value(ty: ColumnType, s: &str) -> Result<Value> {
    Ok(match ty {
        ColumnType::Int => Value::Int(s.parse().with_context(|| format!("'{}' is not an integer", s))?),
        ColumnType::Str => Value::Str(s.to_string()),
    })
}

/// One row as comma-separated values in column order.
pub fn parse_row(def: &TableDef, s: &str) -> Result<Row> {
    let cells: Vec<&str> = s.split(',').collect();
    ensure!(
        cells.len() == def.columns.len(),
        "expected {} values, got {}",
        def.columns.len(),
        cells.len()
    );
    cells
        .iter()
        .zip(&def.columns)
        .map(|(cell, column)| parse_value(column.ty, cell))
        .collect()
}

/// Inclusive range on the first sort key column. An end needs a start.
fn parse_range(def: &TableDef, start: Option<&str>, end: Option<&str>) -> Result<KeyRange> {
    let first = def.sort_key.first().context("table has no sort key")?;
    let ty = def.columns[def.column_index(first)?].ty;
    let start = start.map(|s| parse_value(ty, s)).transpose()?;
    let end = end.map(|s| parse_value(ty, s)).transpose()?;
    Ok(match (start, end) {
        (None, _) => KeyRange::all(),
        (Some(s), None) => KeyRange::from(vec![s]),
        (Some(s), Some(e)) => KeyRange::between(vec![s], vec![e]),
    })
}
