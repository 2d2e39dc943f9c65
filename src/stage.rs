use futures::stream::{self, BoxStream, StreamExt};

use crate::error::Result;
use crate::types::Item;

/// Lazy, ordered sequence of items flowing between stages
pub type ItemStream = BoxStream<'static, Result<Item>>;

/// A pipeline stage spliced between an upstream source and a downstream sink
pub trait Stage: Send {
    /// Short name used in logs and error context
    fn name(&self) -> &'static str;

    /// Consume `previous` and produce this stage's output
    fn run(self: Box<Self>, previous: ItemStream) -> ItemStream;
}

/// Upstream of already-available items
pub fn items<I>(items: I) -> ItemStream
where
    I: IntoIterator<Item = Item>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Upstream that yields nothing
pub fn empty() -> ItemStream {
    stream::empty().boxed()
}
