//! Bounded parallel map over independent work items (input files, partitions,
//! the pairs of one merge round).

use crate::error::Result;
use rayon::prelude::*;

/// Apply `f` to every item with at most `limit` items in flight, preserving
/// input order in the output. The first error aborts; items in the failing
/// chunk may still have run.
pub fn map_limited<T, R, F>(items: Vec<T>, limit: usize, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Sync + Fn(T) -> Result<R>,
{
    let mut out = Vec::with_capacity(items.len());
    if limit <= 1 {
        for item in items {
            out.push(f(item)?);
        }
        return Ok(out);
    }
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let chunk: Vec<T> = items.by_ref().take(limit).collect();
        let results: Vec<R> = chunk.into_par_iter().map(&f).collect::<Result<Vec<R>>>()?;
        out.extend(results);
    }
    Ok(out)
}
