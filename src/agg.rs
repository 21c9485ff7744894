//! Two-level chunked reductions.
//!
//! An aggregation over a chunked source runs as `partial` per chunk, a
//! balanced tree of pairwise `combine` steps, and one `finalize`. The
//! [`Partial`] carries count, mean, m2 (sum of squared deviations), min and
//! max, which is enough to finalize every supported [`Agg`]. Means combine
//! by weight, never by averaging the per-chunk means:
//!
//! ```text
//! mean = (mean_a * count_a + mean_b * count_b) / (count_a + count_b)
//! ```
//!
//! The three reduction steps are registered as `tsumugi.*` functions (see
//! [`register_builtins`]) so reductions also run on the name-resolving
//! backends.

use anyhow::{anyhow, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::expr::{Delayed, delay, lit};
use crate::func::{Func, Registry};
use crate::source::ChunkSource;
use crate::value::Value;

/// The running aggregate of one chunk, or of a combination of chunks.
///
/// Accumulation uses Welford's recurrence and merging uses the parallel
/// (Chan) form, so variance stays numerically stable regardless of how the
/// combine tree is shaped.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partial {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean.
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for Partial {
    /// The merge identity: zero observations.
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Partial {
    pub fn from_values(values: &[f64]) -> Self {
        let mut partial = Self::default();
        for &x in values {
            partial.push(x);
        }
        partial
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    /// Combines two partials as if their observations had been accumulated
    /// together. Commutative and associative up to float rounding.
    pub fn merge(&self, other: &Partial) -> Partial {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }

        let count = self.count + other.count;
        let (n_a, n_b, n) = (self.count as f64, other.count as f64, count as f64);
        let mean = (self.mean * n_a + other.mean * n_b) / n;
        let delta = other.mean - self.mean;
        let m2 = self.m2 + other.m2 + delta * delta * n_a * n_b / n;

        Partial {
            count,
            mean,
            m2,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut record = std::collections::BTreeMap::new();
        record.insert("count".to_owned(), Value::from(self.count));
        record.insert("mean".to_owned(), Value::Float(self.mean));
        record.insert("m2".to_owned(), Value::Float(self.m2));
        record.insert("min".to_owned(), Value::Float(self.min));
        record.insert("max".to_owned(), Value::Float(self.max));
        Value::Record(record)
    }

    pub fn from_value(value: &Value) -> anyhow::Result<Partial> {
        let record = value
            .as_record()
            .ok_or_else(|| anyhow!("expected a partial record, got {}", value.type_name()))?;
        let field = |name: &str| {
            record
                .get(name)
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("partial record is missing '{name}'"))
        };
        Ok(Partial {
            count: field("count")? as u64,
            mean: field("mean")?,
            m2: field("m2")?,
            min: field("min")?,
            max: field("max")?,
        })
    }
}

/// The aggregations a chunked reduction can finalize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Agg {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    /// Population standard deviation.
    Std,
}

impl Agg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agg::Count => "count",
            Agg::Sum => "sum",
            Agg::Mean => "mean",
            Agg::Min => "min",
            Agg::Max => "max",
            Agg::Std => "std",
        }
    }

    pub fn from_str(name: &str) -> anyhow::Result<Agg> {
        match name {
            "count" => Ok(Agg::Count),
            "sum" => Ok(Agg::Sum),
            "mean" => Ok(Agg::Mean),
            "min" => Ok(Agg::Min),
            "max" => Ok(Agg::Max),
            "std" => Ok(Agg::Std),
            _ => bail!("unknown aggregation '{name}'"),
        }
    }

    /// Extracts the final answer from a fully combined [`Partial`].
    pub fn finalize(&self, partial: &Partial) -> anyhow::Result<Value> {
        if partial.count == 0 && *self != Agg::Count {
            bail!("cannot take the {} of an empty source", self.as_str());
        }
        Ok(match self {
            Agg::Count => Value::Int(partial.count as i64),
            Agg::Sum => Value::Float(partial.mean * partial.count as f64),
            Agg::Mean => Value::Float(partial.mean),
            Agg::Min => Value::Float(partial.min),
            Agg::Max => Value::Float(partial.max),
            Agg::Std => Value::Float((partial.m2 / partial.count as f64).sqrt()),
        })
    }
}

/// The per-chunk aggregation step, registered as `tsumugi.partial`.
pub fn partial_func() -> Func {
    Func::new("tsumugi.partial", |args, _| {
        let items = args
            .first()
            .and_then(Value::as_list)
            .ok_or_else(|| anyhow!("partial expects a list of numbers"))?;
        let numbers: Vec<f64> = items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| anyhow!("non-numeric chunk element of type {}", v.type_name()))
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(Partial::from_values(&numbers).to_value())
    })
}

/// The pairwise merge step, registered as `tsumugi.combine`.
pub fn combine_func() -> Func {
    Func::new("tsumugi.combine", |args, _| {
        let [a, b] = args else {
            bail!("combine expects exactly two partials");
        };
        Ok(Partial::from_value(a)?.merge(&Partial::from_value(b)?).to_value())
    })
}

/// The answer-extraction step, registered as `tsumugi.finalize`. Takes the
/// aggregation name as the `agg` keyword argument.
pub fn finalize_func() -> Func {
    Func::new("tsumugi.finalize", |args, kwargs| {
        let partial = args
            .first()
            .ok_or_else(|| anyhow!("finalize expects a combined partial"))
            .and_then(Partial::from_value)?;
        let agg = kwargs
            .get("agg")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("finalize needs an 'agg' keyword argument"))?;
        Agg::from_str(agg)?.finalize(&partial)
    })
}

/// Registers the reduction step functions. Worker-side registries need these
/// for reductions to run on the process and distributed backends.
pub fn register_builtins(registry: &mut Registry) {
    registry.register(partial_func());
    registry.register(combine_func());
    registry.register(finalize_func());
}

/// Builds the deferred two-level reduction of a chunked source.
///
/// Nothing is loaded here; the returned handle resolves to the aggregated
/// value when computed. Chunks load and reduce independently, so a failing
/// chunk fails only its own branch of the graph.
pub fn reduction(source: &dyn ChunkSource, agg: Agg) -> anyhow::Result<Delayed> {
    let partitions = source.partitions()?;
    ensure!(!partitions.is_empty(), "source has no partitions");

    let partial = partial_func();
    let mut layer: Vec<Delayed> = partitions
        .into_iter()
        .map(|partition| {
            let chunk = delay(partition.loader).call([lit(partition.id)]);
            delay(partial.clone()).call([chunk.into()])
        })
        .collect();

    // Balanced pairwise combine; depth grows with log2 of the chunk count.
    let combine = combine_func();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => delay(combine.clone()).call([a.into(), b.into()]),
                [a] => a.clone(),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    let combined = layer.pop().expect("at least one partition");

    Ok(delay(finalize_func())
        .kwarg("agg", agg.as_str())
        .call([combined.into()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;
    use crate::expr::compute_many;
    use crate::sched::{ComputeOptions, Serial, ThreadPool};
    use crate::source::{MemorySource, Partition};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// Three chunks of 10, 9 and 8 observations with means 80, 90 and 85.
    fn survey_chunks() -> Vec<Vec<f64>> {
        vec![
            vec![80.0; 10],
            vec![90.0; 9],
            vec![85.0; 8],
        ]
    }

    #[test]
    fn means_combine_by_weight_not_by_averaging() {
        let partials: Vec<Partial> = survey_chunks()
            .iter()
            .map(|chunk| Partial::from_values(chunk))
            .collect();

        let merged = partials[0].merge(&partials[1]).merge(&partials[2]);
        assert_eq!(merged.count, 27);
        // (80*10 + 90*9 + 85*8) / 27 = 2290/27, not (80 + 90 + 85) / 3.
        assert!(close(merged.mean, 2290.0 / 27.0));
        assert!(!close(merged.mean, 85.0));
    }

    #[test]
    fn merge_is_order_independent() {
        let a = Partial::from_values(&[1.0, 2.0, 3.0]);
        let b = Partial::from_values(&[10.0, 20.0]);
        let c = Partial::from_values(&[5.5]);

        let left = a.merge(&b).merge(&c);
        let right = c.merge(&b.merge(&a));
        assert_eq!(left.count, right.count);
        assert!(close(left.mean, right.mean));
        assert!(close(left.m2, right.m2));
        assert_eq!(left.min, right.min);
        assert_eq!(left.max, right.max);
    }

    #[test]
    fn merged_partials_match_a_single_pass() {
        let all: Vec<f64> = (0..100).map(|i| (i as f64).sin() * 10.0).collect();
        let (front, back) = all.split_at(37);

        let merged = Partial::from_values(front).merge(&Partial::from_values(back));
        let single = Partial::from_values(&all);

        assert_eq!(merged.count, single.count);
        assert!(close(merged.mean, single.mean));
        assert!(close(merged.m2, single.m2));
        assert_eq!(merged.min, single.min);
        assert_eq!(merged.max, single.max);
    }

    #[test]
    fn empty_partial_is_the_merge_identity() {
        let some = Partial::from_values(&[4.0, 6.0]);
        let empty = Partial::default();

        assert_eq!(empty.merge(&some), some);
        assert_eq!(some.merge(&empty), some);
        assert!(Agg::Mean.finalize(&empty).is_err());
        assert_eq!(Agg::Count.finalize(&empty).unwrap(), Value::Int(0));
    }

    #[test]
    fn partial_survives_the_value_encoding() {
        let partial = Partial::from_values(&[1.0, 2.0, 4.0]);
        let decoded = Partial::from_value(&partial.to_value()).unwrap();
        assert_eq!(decoded, partial);
    }

    #[test]
    fn reduction_computes_the_weighted_mean() {
        let source = MemorySource::new(survey_chunks());
        let mean = reduction(&source, Agg::Mean).unwrap();

        let serial = mean.compute(&Serial).unwrap();
        let threaded = mean.compute(&ThreadPool::new(3).unwrap()).unwrap();
        assert_eq!(serial, threaded);
        let Value::Float(out) = serial else {
            panic!("expected a float, got {serial:?}")
        };
        assert!(close(out, 2290.0 / 27.0));
    }

    #[test]
    fn reduction_finalizes_every_aggregation() {
        let source = MemorySource::new(vec![vec![1.0, 5.0], vec![3.0]]);

        let expect = [
            (Agg::Count, Value::Int(3)),
            (Agg::Sum, Value::Float(9.0)),
            (Agg::Mean, Value::Float(3.0)),
            (Agg::Min, Value::Float(1.0)),
            (Agg::Max, Value::Float(5.0)),
        ];
        for (agg, want) in expect {
            let got = reduction(&source, agg).unwrap().compute(&Serial).unwrap();
            assert_eq!(got, want, "{}", agg.as_str());
        }

        let std = reduction(&source, Agg::Std).unwrap().compute(&Serial).unwrap();
        let Value::Float(std) = std else { panic!() };
        // Population std of {1, 5, 3}.
        assert!(close(std, (8.0_f64 / 3.0).sqrt()));
    }

    /// A source whose partitions share one loader that fails for one chunk.
    struct HolePunched {
        chunks: usize,
        broken: usize,
    }

    impl crate::source::ChunkSource for HolePunched {
        fn partitions(&self) -> anyhow::Result<Vec<Partition>> {
            let broken = self.broken;
            let loader = Func::new("tsumugi.holey_chunk", move |args, _| {
                let id = args[0].as_str().unwrap_or_default();
                let index: usize = id.trim_start_matches("chunk-").parse()?;
                if index == broken {
                    bail!("chunk {index} is corrupt");
                }
                Ok(Value::from(vec![index as f64; 4]))
            });
            Ok((0..self.chunks)
                .map(|index| Partition {
                    id: format!("chunk-{index}"),
                    count: Some(4),
                    loader: loader.clone(),
                })
                .collect())
        }
    }

    #[test]
    fn one_corrupt_chunk_fails_only_its_branch() {
        let source = HolePunched { chunks: 7, broken: 3 };
        let partitions = source.partitions().unwrap();

        // Reduce each chunk independently instead of combining, so the six
        // healthy chunks stay retrievable next to the broken one.
        let partial = partial_func();
        let branches: Vec<_> = partitions
            .into_iter()
            .map(|p| {
                let chunk = delay(p.loader).call([lit(p.id)]);
                delay(partial.clone()).call([chunk.into()])
            })
            .collect();

        let options = ComputeOptions::default().best_effort();
        let result = compute_many(&branches, &ThreadPool::new(4).unwrap(), &options).unwrap();

        let mut healthy = 0;
        let mut broken = 0;
        for branch in &branches {
            if let Some(value) = result.value(branch.id()) {
                healthy += 1;
                assert_eq!(Partial::from_value(value).unwrap().count, 4);
            } else {
                broken += 1;
            }
        }
        assert_eq!((healthy, broken), (6, 1));
        assert!(result.failures().any(|f| f.to_string().contains("corrupt")));
    }

    #[test]
    fn full_reduction_over_a_corrupt_chunk_reports_the_loader() {
        let source = HolePunched { chunks: 7, broken: 3 };
        let mean = reduction(&source, Agg::Mean).unwrap();

        let err = mean.compute(&Serial).unwrap_err();
        let ComputeError::Task(task) = err else {
            panic!("expected a task failure, got {err:?}")
        };
        assert_eq!(task.name, "tsumugi.holey_chunk");
    }
}
