//! Chunked data sources feeding two-level reductions.
//!
//! A source splits a dataset into [`Partition`]s that load independently;
//! [`reduction`](crate::agg::reduction) then builds one graph branch per
//! partition. Loaders are named [`Func`]s taking the partition id as their
//! only argument, so a source works unchanged on every backend, including
//! the ones that resolve functions by name on the worker side.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use camino::Utf8PathBuf;

use crate::func::Func;
use crate::value::Value;

/// One independently loadable chunk of a dataset.
pub struct Partition {
    /// Identifier handed to the loader: a file path, shard name, index.
    pub id: String,
    /// Size hint for planning. The loaded data is authoritative; a partition
    /// that turns out shorter or longer than its hint is not an error.
    pub count: Option<u64>,
    /// Loads the chunk's values when called with `id`.
    pub loader: Func,
}

/// A dataset that knows how to enumerate its partitions.
pub trait ChunkSource {
    fn partitions(&self) -> anyhow::Result<Vec<Partition>>;
}

/// An in-memory source, one partition per chunk. Mostly useful for small
/// datasets and for exercising reductions without touching the filesystem.
#[derive(Clone)]
pub struct MemorySource {
    chunks: Arc<Vec<Vec<f64>>>,
}

impl MemorySource {
    pub fn new(chunks: Vec<Vec<f64>>) -> Self {
        Self {
            chunks: Arc::new(chunks),
        }
    }
}

impl ChunkSource for MemorySource {
    fn partitions(&self) -> anyhow::Result<Vec<Partition>> {
        let chunks = Arc::clone(&self.chunks);
        let loader = Func::new("tsumugi.memory_chunk", move |args, _| {
            let id = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("memory loader expects a chunk id"))?;
            let index: usize = id
                .strip_prefix("chunk-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| anyhow!("malformed chunk id '{id}'"))?;
            let chunk = chunks
                .get(index)
                .ok_or_else(|| anyhow!("chunk {index} is out of range"))?;
            Ok(Value::from(chunk.clone()))
        });

        Ok(self
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| Partition {
                id: format!("chunk-{index}"),
                count: Some(chunk.len() as u64),
                loader: loader.clone(),
            })
            .collect())
    }
}

/// Parses numeric values from text, the caller's side of a [`GlobSource`].
pub type Parser = Arc<dyn Fn(&str) -> anyhow::Result<Vec<f64>> + Send + Sync>;

/// A file-per-partition source matching a glob pattern.
///
/// Enumeration happens at graph build time; loading and parsing are deferred
/// into per-partition tasks. Matched paths are sorted so a pattern always
/// yields the same graph.
#[derive(Clone)]
pub struct GlobSource {
    pattern: String,
    parser: Parser,
}

impl GlobSource {
    pub fn new(pattern: impl Into<String>, parser: Parser) -> Self {
        Self {
            pattern: pattern.into(),
            parser,
        }
    }

    /// A source over files holding one number per line.
    pub fn lines(pattern: impl Into<String>) -> Self {
        Self::new(pattern, Arc::new(parse_lines))
    }
}

impl ChunkSource for GlobSource {
    fn partitions(&self) -> anyhow::Result<Vec<Partition>> {
        let mut paths: Vec<Utf8PathBuf> = Vec::new();
        for entry in glob::glob(&self.pattern).context("invalid glob pattern")? {
            let path = entry.context("unreadable glob entry")?;
            let path = Utf8PathBuf::from_path_buf(path)
                .map_err(|p| anyhow!("non-UTF-8 path {}", p.display()))?;
            paths.push(path);
        }
        paths.sort();

        let parser = Arc::clone(&self.parser);
        let loader = Func::new("tsumugi.load_file", move |args, _| {
            let path = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("file loader expects a path"))?;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            let values = parser(&text).with_context(|| format!("parsing {path}"))?;
            Ok(Value::from(values))
        });

        Ok(paths
            .into_iter()
            .map(|path| Partition {
                id: path.into_string(),
                count: None,
                loader: loader.clone(),
            })
            .collect())
    }
}

/// One number per line; blank lines and `#` comments are skipped.
pub fn parse_lines(text: &str) -> anyhow::Result<Vec<f64>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<f64>()
                .map_err(|e| anyhow!("bad number '{line}': {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::Kwargs;

    #[test]
    fn memory_source_loads_its_chunks() {
        let source = MemorySource::new(vec![vec![1.0, 2.0], vec![3.0]]);
        let partitions = source.partitions().unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].count, Some(2));
        let loaded = partitions[1]
            .loader
            .invoke(&[Value::from("chunk-1")], &Kwargs::new())
            .unwrap();
        assert_eq!(loaded, Value::from(vec![3.0]));
    }

    #[test]
    fn memory_source_rejects_bad_ids() {
        let source = MemorySource::new(vec![vec![1.0]]);
        let loader = &source.partitions().unwrap()[0].loader;

        assert!(loader.invoke(&[Value::from("chunk-9")], &Kwargs::new()).is_err());
        assert!(loader.invoke(&[Value::from("nonsense")], &Kwargs::new()).is_err());
    }

    #[test]
    fn parse_lines_skips_blanks_and_comments() {
        let text = "1.5\n\n# header\n 2.5 \n3\n";
        assert_eq!(parse_lines(text).unwrap(), vec![1.5, 2.5, 3.0]);
        assert!(parse_lines("1.0\noops\n").is_err());
    }

    #[test]
    fn glob_source_enumerates_sorted_files() {
        let dir = std::env::temp_dir().join(format!("tsumugi-glob-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.txt"), "2.0\n").unwrap();
        std::fs::write(dir.join("a.txt"), "1.0\n").unwrap();

        let pattern = format!("{}/*.txt", dir.display());
        let partitions = GlobSource::lines(&pattern).partitions().unwrap();

        assert_eq!(partitions.len(), 2);
        assert!(partitions[0].id.ends_with("a.txt"));
        let loaded = partitions[0]
            .loader
            .invoke(&[Value::from(partitions[0].id.as_str())], &Kwargs::new())
            .unwrap();
        assert_eq!(loaded, Value::from(vec![1.0]));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
