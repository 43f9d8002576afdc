//! Channel-chain segmentation.
//!
//! A channel chain is a maximal run of adjacent Process instructions whose
//! outputs have the same channel count and whose modules only ever read the
//! matching input channel. Such a run can be handed to the workers as a whole:
//! each worker walks the run over its own channel range and the workers only
//! meet again at the end of the run.
//!
//! Segmentation is a single forward pass. Repeat bodies are segmented on
//! their own; a repeat whose body never broke is `thread_safe` and may be
//! absorbed into the surrounding chain.

#![forbid(unsafe_code)]

use crate::datum::{ChainSpan, DatumId, DatumKind, DatumList, ProcessId};
use crate::invariant_ppt::{assert_invariant, CHAIN_EXCLUDES_UNSAFE, CHAIN_SEGMENTATION};
use crate::process::Process;

/// Chain under construction.
struct Open {
    start: DatumId,
    members: Vec<ProcessId>,
    channels: usize,
}

struct Walk<'l> {
    list: &'l DatumList,
    processes: &'l [Process],
    chains: Vec<(DatumId, ChainSpan)>,
    thread_safe: Vec<DatumId>,
}

impl Walk<'_> {
    fn close(&mut self, open: Option<Open>, passed_thread_end: Option<DatumId>) {
        if let Some(open) = open {
            self.chains.push((
                open.start,
                ChainSpan {
                    passed_thread_end,
                    members: open.members,
                    channels: open.channels,
                },
            ));
        }
    }

    /// Segment `[start, end)`; returns true if the range contained a break.
    fn segment(&mut self, start: Option<DatumId>, end: Option<DatumId>) -> bool {
        let list = self.list;
        let mut open: Option<Open> = None;
        let mut broke = false;
        let mut pc = start;

        while let Some(id) = pc {
            if Some(id) == end {
                break;
            }
            let Some(datum) = list.get(id) else {
                break;
            };
            let next = datum.next;

            match &datum.kind {
                DatumKind::Process { process, .. } => {
                    let (channels, chainable) = match self.processes.get(process.0) {
                        Some(p) => (p.num_channels(), p.thread_mode().allows_chain_threading()),
                        None => (0, false),
                    };
                    if !chainable {
                        broke = true;
                        self.close(open.take(), Some(id));
                        self.chains.push((
                            id,
                            ChainSpan {
                                passed_thread_end: next,
                                members: vec![*process],
                                channels,
                            },
                        ));
                    } else {
                        match open.as_mut() {
                            Some(o) if o.channels == channels => o.members.push(*process),
                            _ => {
                                broke |= open.is_some();
                                self.close(open.take(), Some(id));
                                open = Some(Open {
                                    start: id,
                                    members: vec![*process],
                                    channels,
                                });
                            }
                        }
                    }
                    pc = next;
                }
                DatumKind::Repeat { stop_pc: Some(stop), .. } => {
                    let stop = *stop;
                    let mark = self.chains.len();
                    let body_broke = self.segment(next, Some(stop));
                    let resume = list.get(stop).and_then(|d| d.next);

                    if body_broke {
                        broke = true;
                        self.close(open.take(), Some(id));
                        pc = resume;
                        continue;
                    }

                    self.thread_safe.push(id);
                    // An unbroken body produced at most one chain.
                    let body = self.chains.drain(mark..).next();
                    if let Some((_, span)) = body {
                        match open.as_mut() {
                            Some(o) if o.channels == span.channels => o.members.extend(span.members),
                            _ => {
                                broke |= open.is_some();
                                self.close(open.take(), Some(id));
                                open = Some(Open {
                                    start: id,
                                    members: span.members,
                                    channels: span.channels,
                                });
                            }
                        }
                    }
                    pc = resume;
                }
                _ => {
                    broke = true;
                    self.close(open.take(), Some(id));
                    pc = next;
                }
            }
        }

        self.close(open, pc);
        broke
    }
}

/// Recompute the channel chains of `list`.
///
/// Clears previous results, then records a [`ChainSpan`] on the first
/// instruction of every chain and marks unbroken repeats `thread_safe`.
/// Every process instruction ends up in exactly one chain; modules that
/// are not chain compatible always form a chain of their own.
pub(crate) fn determine_channel_chains(
    list: &mut DatumList,
    processes: &[Process],
) -> Vec<(DatumId, ChainSpan)> {
    list.clear_chains();
    let mut walk = Walk {
        list: &*list,
        processes,
        chains: Vec::new(),
        thread_safe: Vec::new(),
    };
    walk.segment(list.head(), None);
    let Walk {
        mut chains,
        thread_safe,
        ..
    } = walk;
    chains.sort_by_key(|(start, _)| *start);

    let mut covered: Vec<ProcessId> = chains
        .iter()
        .flat_map(|(_, span)| span.members.iter().copied())
        .collect();
    covered.sort();
    let mut expected: Vec<ProcessId> = list.process_ids().collect();
    expected.sort();
    assert_invariant(
        CHAIN_SEGMENTATION,
        covered == expected,
        "every process belongs to exactly one chain",
        None,
    );
    assert_invariant(
        CHAIN_EXCLUDES_UNSAFE,
        chains.iter().all(|(_, span)| {
            span.members.len() < 2
                || span.members.iter().all(|m| {
                    processes
                        .get(m.0)
                        .is_some_and(|p| p.thread_mode().allows_chain_threading())
                })
        }),
        "multi-node chains hold only chain-compatible modules",
        None,
    );

    for id in thread_safe {
        if let Some(d) = list.get_mut(id) {
            d.thread_safe = true;
        }
    }
    for (start, span) in &chains {
        log::debug!(
            "chain at {}: {} members x {} channels, ends before {:?}",
            start.0,
            span.members.len(),
            span.channels,
            span.passed_thread_end.map(|d| d.0)
        );
        if let Some(d) = list.get_mut(*start) {
            d.chain = Some(span.clone());
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Gain, Isolated};
    use crate::signal::SignalShape;
    use std::sync::Arc;

    fn process(pid: usize) -> DatumKind {
        DatumKind::Process {
            process: ProcessId(pid),
            inputs: vec![],
            outputs: vec![],
            on: true,
        }
    }

    fn prepared(channels: usize, chainable: bool) -> Process {
        let module: Arc<dyn crate::module::ModuleDyn> = if chainable {
            Arc::new(Gain::new(1.0))
        } else {
            Arc::new(Isolated::default())
        };
        let mut p = Process::new("p", module, 0);
        p.pre_thread_init(&[SignalShape {
            channels,
            length: 4,
            dt: 1e-3,
        }])
        .unwrap();
        p
    }

    fn members(chains: &[(DatumId, ChainSpan)]) -> Vec<Vec<usize>> {
        chains
            .iter()
            .map(|(_, s)| s.members.iter().map(|m| m.0).collect())
            .collect()
    }

    #[test]
    fn channel_change_breaks_chain() {
        let mut list = DatumList::new();
        for i in 0..5 {
            list.push(Some(format!("p{}", i)), process(i)).unwrap();
        }
        let processes: Vec<_> = [4, 4, 4, 8, 8].iter().map(|&c| prepared(c, true)).collect();
        let chains = determine_channel_chains(&mut list, &processes);
        assert_eq!(members(&chains), vec![vec![0, 1, 2], vec![3, 4]]);
        assert_eq!(chains[0].1.passed_thread_end, Some(DatumId(3)));
        assert_eq!(chains[1].1.passed_thread_end, None);
        assert!(list.get(DatumId(0)).unwrap().chain.is_some());
        assert!(list.get(DatumId(1)).unwrap().chain.is_none());
    }

    #[test]
    fn unchainable_module_stands_alone() {
        let mut list = DatumList::new();
        for i in 0..3 {
            list.push(Some(format!("p{}", i)), process(i)).unwrap();
        }
        let processes = vec![prepared(4, true), prepared(4, false), prepared(4, true)];
        let chains = determine_channel_chains(&mut list, &processes);
        assert_eq!(members(&chains), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn clean_repeat_joins_enclosing_chain() {
        let mut list = DatumList::new();
        list.push(Some("p0".into()), process(0)).unwrap();
        let r = list
            .push(Some("r".into()), DatumKind::Repeat { count: 2, stop_pc: None })
            .unwrap();
        list.push(Some("p1".into()), process(1)).unwrap();
        let stop = list.push(None, DatumKind::Stop).unwrap();
        list.push(Some("p2".into()), process(2)).unwrap();
        list.get_mut(r).unwrap().kind = DatumKind::Repeat {
            count: 2,
            stop_pc: Some(stop),
        };
        let processes = vec![prepared(3, true), prepared(3, true), prepared(3, true)];
        let chains = determine_channel_chains(&mut list, &processes);
        assert_eq!(members(&chains), vec![vec![0, 1, 2]]);
        assert!(list.get(r).unwrap().thread_safe);
    }

    #[test]
    fn broken_repeat_body_keeps_its_own_chains() {
        let mut list = DatumList::new();
        list.push(Some("p0".into()), process(0)).unwrap();
        let r = list
            .push(Some("r".into()), DatumKind::Repeat { count: 2, stop_pc: None })
            .unwrap();
        list.push(Some("p1".into()), process(1)).unwrap();
        list.push(Some("p2".into()), process(2)).unwrap();
        let stop = list.push(None, DatumKind::Stop).unwrap();
        list.get_mut(r).unwrap().kind = DatumKind::Repeat {
            count: 2,
            stop_pc: Some(stop),
        };
        let processes = vec![prepared(3, true), prepared(3, true), prepared(5, true)];
        let chains = determine_channel_chains(&mut list, &processes);
        assert_eq!(members(&chains), vec![vec![0], vec![1], vec![2]]);
        assert!(!list.get(r).unwrap().thread_safe);
        assert_eq!(chains[1].1.passed_thread_end, Some(DatumId(3)));
        assert_eq!(chains[2].1.passed_thread_end, Some(stop));
    }
}
