//! Lazy pull-stream combinators (C3).
//!
//! Streams throughout the pipeline are `futures` pull streams of
//! `Result<T, E>`: single consumer, nothing read from the source until the
//! consumer polls, upstream order preserved. Dropping a stream releases the
//! underlying HTTP body. These helpers are the only combinators the
//! transformer layer uses, so laziness and ordering are guaranteed in one
//! place.

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;

pub type ResultStream<T, E> = BoxStream<'static, Result<T, E>>;

/// Lift an in-memory slice into a stream.
pub fn from_slice<T, E>(items: Vec<T>) -> ResultStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Map each success value; errors pass through unchanged.
pub fn map_ok<T, U, E, F>(source: ResultStream<T, E>, f: F) -> ResultStream<U, E>
where
    F: FnMut(T) -> U + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    let mut f = f;
    source
        .map(move |item| item.map(|value| f(value)))
        .boxed()
}

/// Map each success value through a fallible function. The first mapping
/// error is yielded and terminates the stream.
pub fn try_map<T, U, E, F>(mut source: ResultStream<T, E>, mut f: F) -> ResultStream<U, E>
where
    F: FnMut(T) -> Result<U, E> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    stream! {
        while let Some(item) = source.next().await {
            match item {
                Ok(value) => match f(value) {
                    Ok(mapped) => yield Ok(mapped),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                },
                Err(err) => yield Err(err),
            }
        }
    }
    .boxed()
}

/// Keep success values matching the predicate; errors pass through.
pub fn filter_ok<T, E, F>(source: ResultStream<T, E>, f: F) -> ResultStream<T, E>
where
    F: FnMut(&T) -> bool + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut f = f;
    source
        .filter(move |item| {
            let keep = match item {
                Ok(value) => f(value),
                Err(_) => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

/// Concatenate two streams lazily; the second is not polled until the first
/// ends.
pub fn append<T, E>(first: ResultStream<T, E>, second: ResultStream<T, E>) -> ResultStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    first.chain(second).boxed()
}

/// Drain a stream to a vector, stopping at the first error.
pub async fn collect_all<T, E>(mut source: ResultStream<T, E>) -> Result<Vec<T>, E> {
    let mut items = Vec::new();
    while let Some(item) = source.next().await {
        items.push(item?);
    }
    Ok(items)
}
