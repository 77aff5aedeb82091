use error_stack::{ensure, Report, ResultExt};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::Mutex;
use sluice_core::encoding::{encode_columns, encode_datum, DatumEncoding, PREFERRED_ENCODING};
use sluice_core::{Datum, Row};
use sluice_physical::{MixHashMode, OutputRouterSpec, RangeRouterSpec, RouterType};

use crate::Error;

/// Where a row goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Destination {
    One(usize),
    All,
}

/// The row dispatch of a router. Everything else is shared by all routers.
#[derive(Debug)]
pub(crate) enum RouterStrategy {
    Mirror,
    Hash {
        hash_columns: Vec<usize>,
    },
    Range {
        spans: Vec<Span>,
        columns: Vec<usize>,
        encodings: Vec<DatumEncoding>,
        default_dest: Option<usize>,
    },
    MixHash {
        hash_column: usize,
        rules: Vec<SkewRule>,
        local_output: Option<usize>,
        /// Last output used for each key of a `HASH_AVERAGE` rule.
        round_robin: Mutex<HashMap<i64, usize>>,
    },
}

#[derive(Debug)]
pub(crate) struct Span {
    start: Vec<u8>,
    end: Vec<u8>,
    output: usize,
}

#[derive(Debug)]
pub(crate) struct SkewRule {
    mode: MixHashMode,
    keys: HashSet<i64>,
}

type Result<T> = error_stack::Result<T, Error>;

impl RouterStrategy {
    /// Validates a router spec and builds its strategy.
    pub fn try_new(spec: &OutputRouterSpec) -> Result<Self> {
        let num_streams = spec.streams.len();
        ensure!(num_streams > 0, Error::NoStreams);

        match &spec.router {
            RouterType::PassThrough => {
                error_stack::bail!(Error::Unsupported("a router for PASS_THROUGH".to_owned()))
            }
            RouterType::Mirror => {
                ensure_two_streams("MIRROR", num_streams)?;
                Ok(RouterStrategy::Mirror)
            }
            RouterType::ByHash { hash_columns } => {
                ensure_two_streams("BY_HASH", num_streams)?;
                ensure!(!hash_columns.is_empty(), Error::NoHashColumns);
                Ok(RouterStrategy::Hash {
                    hash_columns: hash_columns.clone(),
                })
            }
            RouterType::ByRange(range) => Self::try_new_range(range, num_streams),
            RouterType::ByMixHash {
                hash_columns,
                rules,
            } => {
                ensure_two_streams("BY_MIX_HASH", num_streams)?;
                ensure!(
                    hash_columns.len() == 1,
                    Error::MixHashColumns(hash_columns.len())
                );
                ensure!(
                    (1..=2).contains(&rules.len()),
                    Error::MixHashRules(rules.len())
                );

                let mut seen = HashSet::new();
                let mut skew_rules = Vec::with_capacity(rules.len());
                for (index, rule) in rules.iter().enumerate() {
                    ensure!(!rule.skew_keys.is_empty(), Error::EmptySkewKeys(index));
                    let keys: HashSet<i64> = rule.skew_keys.iter().copied().collect();
                    if let Some(key) = keys.iter().find(|key| seen.contains(*key)) {
                        error_stack::bail!(Error::OverlappingSkewKeys(*key));
                    }
                    seen.extend(keys.iter().copied());
                    skew_rules.push(SkewRule {
                        mode: rule.mode,
                        keys,
                    });
                }

                let local_output = spec.local_stream_index();
                let needs_local = skew_rules
                    .iter()
                    .any(|rule| rule.mode == MixHashMode::HashLocal);
                ensure!(!needs_local || local_output.is_some(), Error::NoLocalStream);

                Ok(RouterStrategy::MixHash {
                    hash_column: hash_columns[0],
                    rules: skew_rules,
                    local_output,
                    round_robin: Mutex::new(HashMap::new()),
                })
            }
        }
    }

    fn try_new_range(range: &RangeRouterSpec, num_streams: usize) -> Result<Self> {
        ensure!(!range.encodings.is_empty(), Error::NoRangeEncodings);

        let mut spans = Vec::with_capacity(range.spans.len());
        for (index, span) in range.spans.iter().enumerate() {
            ensure!(
                span.stream < num_streams,
                Error::InvalidSpanStream {
                    span: index,
                    stream: span.stream,
                    streams: num_streams,
                }
            );
            ensure!(span.start < span.end, Error::UnsortedSpan(index));
            spans.push(Span {
                start: span.start.clone(),
                end: span.end.clone(),
                output: span.stream,
            });
        }
        for (index, (prev, next)) in spans.iter().tuple_windows().enumerate() {
            ensure!(prev.end <= next.start, Error::UnsortedSpan(index + 1));
        }
        if let Some(default_dest) = range.default_dest {
            ensure!(
                default_dest < num_streams,
                Error::InvalidSpanStream {
                    span: spans.len(),
                    stream: default_dest,
                    streams: num_streams,
                }
            );
        }

        Ok(RouterStrategy::Range {
            spans,
            columns: range.encodings.iter().map(|e| e.column).collect(),
            encodings: range.encodings.iter().map(|e| e.encoding).collect(),
            default_dest: range.default_dest,
        })
    }

    /// Chooses the destination of `row` among `num_outputs` outputs.
    pub fn route(&self, row: &Row, num_outputs: usize) -> Result<Destination> {
        match self {
            RouterStrategy::Mirror => Ok(Destination::All),
            RouterStrategy::Hash { hash_columns } => {
                Ok(Destination::One(hash_bucket(row, hash_columns, num_outputs)?))
            }
            RouterStrategy::Range {
                spans,
                columns,
                encodings,
                default_dest,
            } => {
                let mut key = Vec::with_capacity(16 * columns.len());
                encode_columns(&mut key, row, columns, encodings).change_context(Error::EncodeKey)?;
                match find_span(spans, &key).or(*default_dest) {
                    Some(output) => Ok(Destination::One(output)),
                    None => error_stack::bail!(Error::NoRangeSpan),
                }
            }
            RouterStrategy::MixHash {
                hash_column,
                rules,
                local_output,
                round_robin,
            } => {
                let key = mix_hash_key(row, *hash_column)?;
                let Some(rule) = rules.iter().find(|rule| rule.keys.contains(&key)) else {
                    let bucket = hash_bucket(row, std::slice::from_ref(hash_column), num_outputs)?;
                    return Ok(Destination::One(bucket));
                };
                match rule.mode {
                    MixHashMode::HashMirror => Ok(Destination::All),
                    MixHashMode::HashLocal => match local_output {
                        Some(local) => Ok(Destination::One(*local)),
                        None => error_stack::bail!(Error::NoLocalStream),
                    },
                    MixHashMode::HashAverage => {
                        let mut round_robin = round_robin.lock();
                        let next = round_robin
                            .entry(key)
                            .and_modify(|last| *last = (*last + 1) % num_outputs)
                            .or_insert(0);
                        Ok(Destination::One(*next))
                    }
                }
            }
        }
    }
}

/// The integer key a mix-hash router matches against its skew rules.
fn mix_hash_key(row: &Row, hash_column: usize) -> Result<i64> {
    let datum = row.get(hash_column).ok_or_else(|| {
        Report::new(sluice_core::Error::ColumnOutOfRange {
            column: hash_column,
            width: row.len(),
        })
        .change_context(Error::EncodeKey)
    })?;
    datum
        .as_int()
        .ok_or_else(|| Report::new(Error::MixHashKey(hash_column)))
}

fn ensure_two_streams(router: &'static str, count: usize) -> Result<()> {
    ensure!(count >= 2, Error::TooFewStreams { router, count });
    Ok(())
}

/// Index of the span whose `[start, end)` contains `key`.
fn find_span(spans: &[Span], key: &[u8]) -> Option<usize> {
    let index = spans.partition_point(|span| span.end.as_slice() <= key);
    spans
        .get(index)
        .filter(|span| span.start.as_slice() <= key)
        .map(|span| span.output)
}

/// The output a row goes to under hash routing: CRC32-C of the preferred
/// encoding of the hash columns, modulo the number of outputs.
pub(crate) fn hash_bucket(row: &Row, hash_columns: &[usize], num_outputs: usize) -> Result<usize> {
    let mut key = Vec::with_capacity(16 * hash_columns.len());
    encode_columns(&mut key, row, hash_columns, &[]).change_context(Error::EncodeKey)?;
    Ok((crc32c::crc32c(&key) as usize) % num_outputs)
}

/// Hash bucket of a projection given as individual datums.
pub(crate) fn hash_bucket_of<'a>(
    datums: impl Iterator<Item = &'a Datum>,
    num_outputs: usize,
) -> usize {
    let mut key = Vec::with_capacity(32);
    for datum in datums {
        encode_datum(&mut key, datum, PREFERRED_ENCODING);
    }
    (crc32c::crc32c(&key) as usize) % num_outputs
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sluice_core::encoding::encode_datum;
    use sluice_physical::{ColumnEncoding, MixHashRule, RangeSpan, StreamEndpointSpec};
    use sluice_testing::int_row;

    use super::*;

    fn streams(n: u32) -> Vec<StreamEndpointSpec> {
        (0..n).map(StreamEndpointSpec::local).collect()
    }

    fn spec(router: RouterType, n: u32) -> OutputRouterSpec {
        OutputRouterSpec::new(router, streams(n))
    }

    fn range_spec(spans: Vec<RangeSpan>, default_dest: Option<usize>) -> OutputRouterSpec {
        spec(
            RouterType::ByRange(RangeRouterSpec {
                spans,
                encodings: vec![ColumnEncoding {
                    column: 0,
                    encoding: DatumEncoding::AscendingKey,
                }],
                default_dest,
            }),
            2,
        )
    }

    fn key(i: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_datum(&mut buf, &Datum::Int(i), DatumEncoding::AscendingKey);
        buf
    }

    #[test]
    fn test_range_routes_by_span() {
        let spans = vec![
            RangeSpan {
                start: vec![0x00],
                end: vec![0x80],
                stream: 0,
            },
            RangeSpan {
                start: vec![0x80],
                end: vec![0xff],
                stream: 1,
            },
        ];
        let strategy = RouterStrategy::try_new(&range_spec(spans, None)).unwrap();
        let route = |i| strategy.route(&int_row(&[i]), 2).unwrap();
        assert_eq!(route(0), Destination::One(0));
        assert_eq!(route(i32::MAX as i64 / 2), Destination::One(0));
        assert_eq!(route(i32::MAX as i64), Destination::One(1));
    }

    #[test]
    fn test_range_without_match() {
        let spans = vec![RangeSpan {
            start: key(10),
            end: key(20),
            stream: 1,
        }];
        let strict = RouterStrategy::try_new(&range_spec(spans.clone(), None)).unwrap();
        assert_eq!(
            strict.route(&int_row(&[15]), 2).unwrap(),
            Destination::One(1)
        );
        let err = strict.route(&int_row(&[20]), 2).unwrap_err();
        assert_eq!(err.current_context(), &Error::NoRangeSpan);

        let with_default = RouterStrategy::try_new(&range_spec(spans, Some(0))).unwrap();
        assert_eq!(
            with_default.route(&int_row(&[5]), 2).unwrap(),
            Destination::One(0)
        );
    }

    #[test]
    fn test_range_validation() {
        let unsorted = vec![
            RangeSpan {
                start: key(10),
                end: key(20),
                stream: 0,
            },
            RangeSpan {
                start: key(15),
                end: key(30),
                stream: 1,
            },
        ];
        let err = RouterStrategy::try_new(&range_spec(unsorted, None)).unwrap_err();
        assert_eq!(err.current_context(), &Error::UnsortedSpan(1));

        let bad_stream = vec![RangeSpan {
            start: key(10),
            end: key(20),
            stream: 5,
        }];
        let err = RouterStrategy::try_new(&range_spec(bad_stream, None)).unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::InvalidSpanStream { stream: 5, .. }
        ));

        let mut no_encodings = range_spec(vec![], None);
        if let RouterType::ByRange(range) = &mut no_encodings.router {
            range.encodings.clear();
        }
        let err = RouterStrategy::try_new(&no_encodings).unwrap_err();
        assert_eq!(err.current_context(), &Error::NoRangeEncodings);
    }

    #[test]
    fn test_router_validation() {
        let err = RouterStrategy::try_new(&spec(RouterType::Mirror, 0)).unwrap_err();
        assert_eq!(err.current_context(), &Error::NoStreams);

        let err = RouterStrategy::try_new(&spec(RouterType::Mirror, 1)).unwrap_err();
        assert_eq!(
            err.current_context(),
            &Error::TooFewStreams {
                router: "MIRROR",
                count: 1
            }
        );

        let err = RouterStrategy::try_new(&spec(
            RouterType::ByHash {
                hash_columns: vec![],
            },
            2,
        ))
        .unwrap_err();
        assert_eq!(err.current_context(), &Error::NoHashColumns);
    }

    fn mix_hash(rules: Vec<MixHashRule>, columns: Vec<usize>) -> OutputRouterSpec {
        spec(
            RouterType::ByMixHash {
                hash_columns: columns,
                rules,
            },
            3,
        )
    }

    fn rule(mode: MixHashMode, keys: &[i64]) -> MixHashRule {
        MixHashRule {
            mode,
            skew_keys: keys.to_vec(),
        }
    }

    #[test]
    fn test_mix_hash_validation() {
        let err = RouterStrategy::try_new(&mix_hash(
            vec![rule(MixHashMode::HashMirror, &[1])],
            vec![0, 1],
        ))
        .unwrap_err();
        assert_eq!(err.current_context(), &Error::MixHashColumns(2));

        let three = vec![
            rule(MixHashMode::HashMirror, &[1]),
            rule(MixHashMode::HashAverage, &[2]),
            rule(MixHashMode::HashLocal, &[3]),
        ];
        let err = RouterStrategy::try_new(&mix_hash(three, vec![0])).unwrap_err();
        assert_eq!(err.current_context(), &Error::MixHashRules(3));

        let overlapping = vec![
            rule(MixHashMode::HashMirror, &[1, 2]),
            rule(MixHashMode::HashAverage, &[2]),
        ];
        let err = RouterStrategy::try_new(&mix_hash(overlapping, vec![0])).unwrap_err();
        assert_eq!(err.current_context(), &Error::OverlappingSkewKeys(2));

        let err = RouterStrategy::try_new(&mix_hash(
            vec![rule(MixHashMode::HashMirror, &[])],
            vec![0],
        ))
        .unwrap_err();
        assert_eq!(err.current_context(), &Error::EmptySkewKeys(0));

        let mut remote_only = mix_hash(vec![rule(MixHashMode::HashLocal, &[1])], vec![0]);
        for (i, stream) in remote_only.streams.iter_mut().enumerate() {
            *stream = StreamEndpointSpec::remote(i as u32, 2u32);
        }
        let err = RouterStrategy::try_new(&remote_only).unwrap_err();
        assert_eq!(err.current_context(), &Error::NoLocalStream);
    }

    #[test]
    fn test_mix_hash_routes_skewed_keys() {
        let rules = vec![
            rule(MixHashMode::HashMirror, &[7]),
            rule(MixHashMode::HashAverage, &[9]),
        ];
        let strategy = RouterStrategy::try_new(&mix_hash(rules, vec![0])).unwrap();

        assert_eq!(
            strategy.route(&int_row(&[7, 0]), 3).unwrap(),
            Destination::All
        );

        let averaged: Vec<_> = (0..6)
            .map(|seq| strategy.route(&int_row(&[9, seq]), 3).unwrap())
            .collect();
        assert_eq!(
            averaged,
            [0, 1, 2, 0, 1, 2].map(Destination::One).to_vec()
        );

        let plain = strategy.route(&int_row(&[4, 0]), 3).unwrap();
        assert_eq!(plain, Destination::One(hash_bucket(&int_row(&[4]), &[0], 3).unwrap()));
    }

    #[test]
    fn test_mix_hash_local() {
        let mut spec = mix_hash(vec![rule(MixHashMode::HashLocal, &[3])], vec![0]);
        spec.streams[0] = StreamEndpointSpec::remote(0u32, 2u32);
        let strategy = RouterStrategy::try_new(&spec).unwrap();
        assert_eq!(
            strategy.route(&int_row(&[3]), 3).unwrap(),
            Destination::One(1)
        );
    }

    #[test]
    fn test_routing_key_errors() {
        let hash = RouterStrategy::try_new(&spec(
            RouterType::ByHash {
                hash_columns: vec![0, 2],
            },
            2,
        ))
        .unwrap();
        let err = hash.route(&int_row(&[1, 2]), 2).unwrap_err();
        assert_eq!(err.current_context(), &Error::EncodeKey);
        assert!(format!("{err:?}").contains("column 2, row with only 2 columns"));

        let strategy = RouterStrategy::try_new(&mix_hash(
            vec![rule(MixHashMode::HashMirror, &[7])],
            vec![1],
        ))
        .unwrap();
        let null_key = Row::new(vec![Datum::Int(7), Datum::Null]);
        let err = strategy.route(&null_key, 3).unwrap_err();
        assert_eq!(err.current_context(), &Error::MixHashKey(1));
        let string_key = Row::new(vec![Datum::Int(7), Datum::from("7")]);
        let err = strategy.route(&string_key, 3).unwrap_err();
        assert_eq!(err.current_context(), &Error::MixHashKey(1));
        let err = strategy.route(&int_row(&[7]), 3).unwrap_err();
        assert_eq!(err.current_context(), &Error::EncodeKey);
    }

    proptest! {
        #[test]
        fn test_hash_locality(key in any::<i64>(), a in any::<i64>(), b in any::<i64>(), n in 2usize..8) {
            let first = hash_bucket(&int_row(&[key, a]), &[0], n).unwrap();
            let second = hash_bucket(&int_row(&[key, b]), &[0], n).unwrap();
            prop_assert_eq!(first, second);
            prop_assert!(first < n);
            prop_assert_eq!(first, hash_bucket_of([Datum::Int(key)].iter(), n));
        }
    }
}
