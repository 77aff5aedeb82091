use std::collections::VecDeque;
use std::sync::Arc;

use sluice_core::encoding::{encode_datum, DatumEncoding};
use sluice_core::{ColumnOrdering, ColumnType, Datum, ErrorKind, MetadataError, ProducerMetadata, Row};
use sluice_execinfra::{FlowCtx, RowMessage, RowSource};

use crate::min_heap::{HasPriority, MinHeap};

/// Merges individually sorted sources into one sorted stream.
///
/// Ties between sources are broken by the source index. Metadata is
/// forwarded as soon as it is read. A source whose rows go backwards stops
/// the merge with an ordering violation error, after which only metadata is
/// forwarded.
pub struct OrderedSync {
    types: Vec<ColumnType>,
    ordering: ColumnOrdering,
    sources: Vec<Box<dyn RowSource>>,
    heap: MinHeap<Head>,
    /// Key of the last row read from each source.
    last_keys: Vec<Option<Vec<u8>>>,
    exhausted: Vec<bool>,
    pending_meta: VecDeque<ProducerMetadata>,
    /// Source of the last row returned, read again on the next call.
    pending_advance: Option<usize>,
    initialized: bool,
    draining: bool,
}

struct Head {
    key: Vec<u8>,
    source: usize,
    row: Row,
}

impl HasPriority for Head {
    type Priority = (Vec<u8>, usize);

    fn priority(&self) -> Self::Priority {
        (self.key.clone(), self.source)
    }
}

impl std::fmt::Debug for OrderedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedSync")
            .field("ordering", &self.ordering)
            .field("sources", &self.sources.len())
            .field("heap", &self.heap.len())
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

impl OrderedSync {
    pub fn new(
        types: Vec<ColumnType>,
        ordering: ColumnOrdering,
        sources: Vec<Box<dyn RowSource>>,
    ) -> Self {
        let n = sources.len();
        Self {
            types,
            ordering,
            sources,
            heap: MinHeap::with_capacity(n),
            last_keys: vec![None; n],
            exhausted: vec![false; n],
            pending_meta: VecDeque::new(),
            pending_advance: None,
            initialized: false,
            draining: false,
        }
    }

    /// Encodes the ordering columns so that byte order is the declared order.
    fn encode_key(&self, row: &Row) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 * self.ordering.0.len());
        for order in self.ordering.iter() {
            let datum = row.get(order.col_idx).unwrap_or(&Datum::Null);
            encode_datum(&mut key, datum, DatumEncoding::from(order.direction));
        }
        key
    }

    /// Reads source `index` up to its next row, buffering metadata, and puts
    /// the row on the heap.
    async fn advance(&mut self, index: usize) {
        if self.exhausted[index] {
            return;
        }
        loop {
            match self.sources[index].next().await {
                Some(RowMessage::Meta(meta)) => self.pending_meta.push_back(meta),
                Some(RowMessage::Row(row)) => {
                    let key = self.encode_key(&row);
                    if let Some(last) = &self.last_keys[index] {
                        if key < *last {
                            self.ordering_violation(index, &row);
                            return;
                        }
                    }
                    self.last_keys[index] = Some(key.clone());
                    self.heap.push(Head {
                        key,
                        source: index,
                        row,
                    });
                    return;
                }
                None => {
                    self.exhausted[index] = true;
                    return;
                }
            }
        }
    }

    fn ordering_violation(&mut self, index: usize, row: &Row) {
        tracing::warn!("Input {index} of ordered synchronizer is out of order at {row}");
        self.pending_meta
            .push_back(ProducerMetadata::Error(MetadataError::new(
                ErrorKind::OrderingViolation,
                format!("input {index} of ordered synchronizer is not sorted: row {row} is out of order"),
            )));
        self.consumer_done();
    }

    /// Next metadata of any source that is not exhausted.
    async fn next_drained_meta(&mut self) -> Option<ProducerMetadata> {
        for index in 0..self.sources.len() {
            while !self.exhausted[index] {
                match self.sources[index].next().await {
                    Some(RowMessage::Meta(meta)) => return Some(meta),
                    Some(RowMessage::Row(_)) => {}
                    None => self.exhausted[index] = true,
                }
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl RowSource for OrderedSync {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, ctx: &Arc<FlowCtx>) {
        for source in self.sources.iter_mut() {
            source.start(ctx);
        }
    }

    async fn next(&mut self) -> Option<RowMessage> {
        if !self.initialized {
            self.initialized = true;
            for index in 0..self.sources.len() {
                if self.draining {
                    break;
                }
                self.advance(index).await;
            }
        }
        if let Some(index) = self.pending_advance.take() {
            if !self.draining {
                self.advance(index).await;
            }
        }

        if let Some(meta) = self.pending_meta.pop_front() {
            return Some(RowMessage::Meta(meta));
        }
        if self.draining {
            return self.next_drained_meta().await.map(RowMessage::Meta);
        }

        let head = self.heap.pop()?;
        self.pending_advance = Some(head.source);
        Some(RowMessage::Row(head.row))
    }

    fn consumer_done(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.heap.clear();
        for source in self.sources.iter_mut() {
            source.consumer_done();
        }
    }

    fn consumer_closed(&mut self) {
        self.draining = true;
        self.heap.clear();
        self.pending_advance = None;
        self.pending_meta.clear();
        for (source, exhausted) in self.sources.iter_mut().zip(self.exhausted.iter_mut()) {
            source.consumer_closed();
            *exhausted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sluice_core::{ColumnOrder, RangeInfo};
    use sluice_execinfra::{RowBuffer, RowReceiver};
    use sluice_testing::{int_column, int_row, int_types};

    use super::*;

    async fn source(rows: &[[i64; 2]], meta: Option<ProducerMetadata>) -> Box<dyn RowSource> {
        let buffer = RowBuffer::new(int_types(2));
        for row in rows {
            buffer.push(RowMessage::Row(int_row(row))).await;
        }
        if let Some(meta) = meta {
            buffer.push(RowMessage::Meta(meta)).await;
        }
        buffer.producer_done();
        Box::new(buffer)
    }

    /// Counts the reads of the wrapped source.
    struct Counted {
        inner: Box<dyn RowSource>,
        reads: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RowSource for Counted {
        fn output_types(&self) -> &[ColumnType] {
            self.inner.output_types()
        }

        fn start(&mut self, ctx: &Arc<FlowCtx>) {
            self.inner.start(ctx)
        }

        async fn next(&mut self) -> Option<RowMessage> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.next().await
        }

        fn consumer_done(&mut self) {
            self.inner.consumer_done()
        }

        fn consumer_closed(&mut self) {
            self.inner.consumer_closed()
        }
    }

    async fn collect(sync: &mut OrderedSync) -> (Vec<Row>, Vec<ProducerMetadata>) {
        let mut rows = Vec::new();
        let mut metas = Vec::new();
        while let Some(msg) = sync.next().await {
            match msg {
                RowMessage::Row(row) => rows.push(row),
                RowMessage::Meta(meta) => metas.push(meta),
            }
        }
        (rows, metas)
    }

    #[tokio::test]
    async fn test_merges_sorted_inputs() {
        let range = ProducerMetadata::Ranges(vec![RangeInfo {
            range_id: 7,
            start_key: vec![],
            end_key: vec![],
            lease_holder: 1u32.into(),
        }]);
        let sources = vec![
            source(&[[1, 0], [4, 0], [4, 1], [9, 0]], None).await,
            source(&[[2, 1], [4, 2], [5, 1]], Some(range.clone())).await,
            source(&[], None).await,
            source(&[[0, 3], [4, 3]], None).await,
        ];
        let mut sync = OrderedSync::new(
            int_types(2),
            ColumnOrdering(vec![ColumnOrder::asc(0)]),
            sources,
        );

        let (rows, metas) = collect(&mut sync).await;
        assert_eq!(int_column(&rows, 0), vec![0, 1, 2, 4, 4, 4, 4, 5, 9]);
        // Equal keys come out in input order.
        assert_eq!(int_column(&rows[3..7], 1), vec![0, 1, 2, 3]);
        assert_eq!(metas, vec![range]);
    }

    #[tokio::test]
    async fn test_descending_ordering() {
        let sources = vec![
            source(&[[9, 0], [3, 0]], None).await,
            source(&[[8, 1], [7, 1], [1, 1]], None).await,
        ];
        let mut sync = OrderedSync::new(
            int_types(2),
            ColumnOrdering(vec![ColumnOrder::desc(0)]),
            sources,
        );
        let (rows, _) = collect(&mut sync).await;
        assert_eq!(int_column(&rows, 0), vec![9, 8, 7, 3, 1]);
    }

    #[tokio::test]
    async fn test_reports_unsorted_input() {
        let range = ProducerMetadata::Ranges(vec![]);
        let sources = vec![
            source(&[[1, 0], [5, 0], [2, 0]], None).await,
            source(&[[3, 1]], Some(range.clone())).await,
        ];
        let mut sync = OrderedSync::new(
            int_types(2),
            ColumnOrdering(vec![ColumnOrder::asc(0)]),
            sources,
        );

        let (rows, metas) = collect(&mut sync).await;
        assert!(int_column(&rows, 0).windows(2).all(|w| w[0] <= w[1]));
        let errors: Vec<_> = metas.iter().filter_map(ProducerMetadata::error).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::OrderingViolation);
        // Metadata of the other inputs still arrives after the violation.
        assert!(metas.contains(&range));
    }

    #[tokio::test]
    async fn test_reads_source_of_returned_row_on_next_call() {
        let reads: Vec<_> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let sources: Vec<Box<dyn RowSource>> = vec![
            Box::new(Counted {
                inner: source(&[[1, 0], [3, 0]], None).await,
                reads: reads[0].clone(),
            }),
            Box::new(Counted {
                inner: source(&[[2, 1]], None).await,
                reads: reads[1].clone(),
            }),
        ];
        let mut sync = OrderedSync::new(
            int_types(2),
            ColumnOrdering(vec![ColumnOrder::asc(0)]),
            sources,
        );
        let count = |i: usize| reads[i].load(Ordering::SeqCst);

        let first = sync.next().await.unwrap();
        assert_eq!(first, RowMessage::Row(int_row(&[1, 0])));
        assert_eq!((count(0), count(1)), (1, 1));

        let second = sync.next().await.unwrap();
        assert_eq!(second, RowMessage::Row(int_row(&[2, 1])));
        assert_eq!((count(0), count(1)), (2, 1));

        let third = sync.next().await.unwrap();
        assert_eq!(third, RowMessage::Row(int_row(&[3, 0])));
        assert_eq!((count(0), count(1)), (2, 2));

        assert!(sync.next().await.is_none());
        assert_eq!((count(0), count(1)), (3, 2));
    }
}
