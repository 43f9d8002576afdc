//! Signal buffers and channel-slice views.
//!
//! A [`Signal`] owns a channels x samples block. Worker threads never copy it:
//! the scheduler carves the channel dimension into disjoint [`ChannelSlice`]s
//! and hands each worker a [`SignalViewMut`] over its own range of the same
//! backing store. Views address channels by their *absolute* index, so a
//! module sees channel 5 as channel 5 whichever thread happens to run it.

#![forbid(unsafe_code)]

use crate::error::SignalError;
use crate::invariant_ppt::{assert_invariant, SLICE_TILING};
use std::ops::Range;
use std::path::Path;

/// A contiguous range of channels owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelSlice {
    /// First channel of the range.
    pub offset: usize,
    /// Number of channels in the range.
    pub count: usize,
}

impl ChannelSlice {
    /// Slice covering `[0, count)`.
    pub fn full(count: usize) -> Self {
        Self { offset: 0, count }
    }

    /// One past the last channel, saturating at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.count)
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Split `num_channels` across `num_threads` workers.
///
/// Each worker receives `num_channels / num_threads` channels and the last
/// worker additionally takes the remainder. The thread count is clamped to
/// the channel count so no worker is handed an empty slice.
pub fn distribute_channels(num_channels: usize, num_threads: usize) -> Vec<ChannelSlice> {
    if num_channels == 0 {
        return Vec::new();
    }
    let threads = num_threads.clamp(1, num_channels);
    let per_thread = num_channels / threads;
    let mut slices: Vec<ChannelSlice> = (0..threads)
        .map(|i| ChannelSlice {
            offset: i * per_thread,
            count: per_thread,
        })
        .collect();
    if let Some(last) = slices.last_mut() {
        last.count += num_channels - per_thread * threads;
    }

    assert_invariant(
        SLICE_TILING,
        tiles_exactly(&slices, num_channels),
        "channel slices must tile [0, N) exactly once",
        Some("distribute_channels"),
    );
    slices
}

/// True if `slices` are contiguous, ascending and cover `[0, num_channels)`.
pub fn tiles_exactly(slices: &[ChannelSlice], num_channels: usize) -> bool {
    let mut next = 0;
    for s in slices {
        if s.offset != next || s.count == 0 {
            return false;
        }
        next = s.end();
    }
    next == num_channels
}

/// Shape of a signal: the part a module declares before it runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalShape {
    pub channels: usize,
    pub length: usize,
    /// Sample period in seconds.
    pub dt: f64,
}

/// Multi-channel sample buffer.
///
/// `offset` and `num_channels` describe the view the owning (thread 0)
/// instance is currently working on. Outside a threaded run they are always
/// `0` and `orig_num_channels`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signal {
    channels: Vec<Vec<f64>>,
    offset: usize,
    num_channels: usize,
    orig_num_channels: usize,
    length: usize,
    dt: f64,
}

impl Signal {
    /// Allocate a zeroed signal.
    pub fn new(channels: usize, length: usize, dt: f64) -> Result<Self, SignalError> {
        if length == 0 {
            return Err(SignalError::ZeroLength);
        }
        if channels == 0 {
            return Err(SignalError::ZeroChannels);
        }
        let alloc_err = |_| SignalError::Allocation { channels, length };

        let mut store = Vec::new();
        store.try_reserve_exact(channels).map_err(alloc_err)?;
        for _ in 0..channels {
            let mut samples = Vec::new();
            samples.try_reserve_exact(length).map_err(alloc_err)?;
            samples.resize(length, 0.0);
            store.push(samples);
        }

        Ok(Self {
            channels: store,
            offset: 0,
            num_channels: channels,
            orig_num_channels: channels,
            length,
            dt,
        })
    }

    /// Allocate a signal for `shape`.
    pub fn with_shape(shape: SignalShape) -> Result<Self, SignalError> {
        Self::new(shape.channels, shape.length, shape.dt)
    }

    /// The signal's shape, or `None` for an unallocated placeholder.
    pub fn shape(&self) -> Option<SignalShape> {
        self.is_allocated().then_some(SignalShape {
            channels: self.orig_num_channels,
            length: self.length,
            dt: self.dt,
        })
    }

    pub fn is_allocated(&self) -> bool {
        self.orig_num_channels > 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn orig_num_channels(&self) -> usize {
        self.orig_num_channels
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Samples of channel `index`.
    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        self.channels.get_mut(index).map(Vec::as_mut_slice)
    }

    /// Fill channel `index` from a sample generator.
    pub fn fill_channel(
        &mut self,
        index: usize,
        mut f: impl FnMut(usize) -> f64,
    ) -> Result<(), SignalError> {
        let orig_num_channels = self.orig_num_channels;
        let samples = self
            .channels
            .get_mut(index)
            .ok_or(SignalError::SliceOutOfRange {
                offset: index,
                end: index.saturating_add(1),
                orig_num_channels,
            })?;
        for (i, s) in samples.iter_mut().enumerate() {
            *s = f(i);
        }
        Ok(())
    }

    /// Zero every sample.
    pub fn clear(&mut self) {
        for samples in &mut self.channels {
            samples.fill(0.0);
        }
    }

    /// Shared view over every channel.
    pub fn view(&self) -> SignalView<'_> {
        SignalView {
            channels: &self.channels,
            offset: 0,
            orig_num_channels: self.orig_num_channels,
            length: self.length,
            dt: self.dt,
        }
    }

    /// Shared view over `[offset, offset + count)`.
    pub fn slice(&self, offset: usize, count: usize) -> Result<SignalView<'_>, SignalError> {
        let end = self.check_range(offset, count)?;
        Ok(SignalView {
            channels: &self.channels[offset..end],
            offset,
            orig_num_channels: self.orig_num_channels,
            length: self.length,
            dt: self.dt,
        })
    }

    /// Disjoint mutable views, one per slice, over the same backing store.
    ///
    /// Slices must be ascending and must not overlap; gaps are allowed.
    pub fn split_views_mut(
        &mut self,
        slices: &[ChannelSlice],
    ) -> Result<Vec<SignalViewMut<'_>>, SignalError> {
        let orig_num_channels = self.orig_num_channels;
        let length = self.length;
        let dt = self.dt;

        let mut views = Vec::with_capacity(slices.len());
        let mut rest: &mut [Vec<f64>] = &mut self.channels;
        let mut consumed = 0;
        for s in slices {
            if s.offset < consumed {
                return Err(SignalError::OverlappingSlices(s.offset));
            }
            if s.offset.checked_add(s.count).map_or(true, |end| end > orig_num_channels) {
                return Err(SignalError::SliceOutOfRange {
                    offset: s.offset,
                    end: s.end(),
                    orig_num_channels,
                });
            }
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(s.offset - consumed);
            let (head, tail) = tail.split_at_mut(s.count);
            views.push(SignalViewMut {
                channels: head,
                offset: s.offset,
                orig_num_channels,
                length,
                dt,
            });
            rest = tail;
            consumed = s.end();
        }
        Ok(views)
    }

    /// Record that the owning instance works on `[offset, offset + count)`.
    pub fn narrow(&mut self, offset: usize, count: usize) -> Result<(), SignalError> {
        self.check_range(offset, count)?;
        self.offset = offset;
        self.num_channels = count;
        Ok(())
    }

    /// Reset the view bookkeeping to the whole signal.
    pub fn restore(&mut self) {
        self.offset = 0;
        self.num_channels = self.orig_num_channels;
    }

    pub fn is_restored(&self) -> bool {
        self.offset == 0 && self.num_channels == self.orig_num_channels
    }

    /// Write every channel to a 32-bit float WAV file.
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<(), SignalError> {
        let channels = u16::try_from(self.orig_num_channels)
            .map_err(|_| SignalError::Io("too many channels for WAV".into()))?;
        if channels == 0 {
            return Err(SignalError::ZeroChannels);
        }
        let sample_rate = if self.dt > 0.0 {
            (1.0 / self.dt).round() as u32
        } else {
            return Err(SignalError::Io("sample period must be positive".into()));
        };
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let io_err = |e: hound::Error| SignalError::Io(e.to_string());
        let mut writer = hound::WavWriter::create(path, spec).map_err(io_err)?;
        for i in 0..self.length {
            for samples in &self.channels {
                writer.write_sample(samples[i] as f32).map_err(io_err)?;
            }
        }
        writer.finalize().map_err(io_err)
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<usize, SignalError> {
        offset
            .checked_add(count)
            .filter(|&end| end <= self.orig_num_channels)
            .ok_or(SignalError::SliceOutOfRange {
                offset,
                end: offset.saturating_add(count),
                orig_num_channels: self.orig_num_channels,
            })
    }
}

/// Read-only window over a channel range.
#[derive(Debug, Clone, Copy)]
pub struct SignalView<'a> {
    channels: &'a [Vec<f64>],
    offset: usize,
    orig_num_channels: usize,
    length: usize,
    dt: f64,
}

impl<'a> SignalView<'a> {
    /// Samples of absolute channel `index`, if it falls inside this view.
    pub fn channel(&self, index: usize) -> Option<&'a [f64]> {
        index
            .checked_sub(self.offset)
            .and_then(|i| self.channels.get(i))
            .map(Vec::as_slice)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn orig_num_channels(&self) -> usize {
        self.orig_num_channels
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Absolute channel indices covered by this view.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.channels.len()
    }

    /// `(absolute index, samples)` for each channel in the view.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a [f64])> + 'a {
        let offset = self.offset;
        self.channels
            .iter()
            .enumerate()
            .map(move |(i, c)| (offset + i, c.as_slice()))
    }
}

/// Mutable window over a channel range, owned by exactly one worker.
#[derive(Debug)]
pub struct SignalViewMut<'a> {
    channels: &'a mut [Vec<f64>],
    offset: usize,
    orig_num_channels: usize,
    length: usize,
    dt: f64,
}

impl<'a> SignalViewMut<'a> {
    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        index
            .checked_sub(self.offset)
            .and_then(|i| self.channels.get_mut(i))
            .map(Vec::as_mut_slice)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn orig_num_channels(&self) -> usize {
        self.orig_num_channels
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.channels.len()
    }

    /// Reborrow as a read-only view.
    pub fn as_view(&self) -> SignalView<'_> {
        SignalView {
            channels: &*self.channels,
            offset: self.offset,
            orig_num_channels: self.orig_num_channels,
            length: self.length,
            dt: self.dt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn signal_rejects_zero_length() {
        assert_eq!(Signal::new(2, 0, 1e-4), Err(SignalError::ZeroLength));
        assert_eq!(Signal::new(0, 8, 1e-4), Err(SignalError::ZeroChannels));
    }

    #[test]
    fn remainder_goes_to_last_slice() {
        let slices = distribute_channels(10, 3);
        assert_eq!(
            slices,
            vec![
                ChannelSlice { offset: 0, count: 3 },
                ChannelSlice { offset: 3, count: 3 },
                ChannelSlice { offset: 6, count: 4 },
            ]
        );
    }

    #[test]
    fn threads_clamped_to_channels() {
        let slices = distribute_channels(3, 8);
        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.count == 1));
    }

    #[test]
    fn slice_out_of_range() {
        let signal = Signal::new(4, 16, 1e-4).unwrap();
        assert!(signal.slice(2, 2).is_ok());
        assert_eq!(
            signal.slice(3, 2).unwrap_err(),
            SignalError::SliceOutOfRange {
                offset: 3,
                end: 5,
                orig_num_channels: 4
            }
        );
    }

    #[test]
    fn huge_ranges_are_errors_not_overflows() {
        let mut signal = Signal::new(4, 4, 1e-3).unwrap();
        assert_eq!(
            signal.slice(usize::MAX, 2).unwrap_err(),
            SignalError::SliceOutOfRange {
                offset: usize::MAX,
                end: usize::MAX,
                orig_num_channels: 4
            }
        );
        assert!(signal.narrow(2, usize::MAX).is_err());
        assert!(signal.is_restored());
        assert!(signal.fill_channel(usize::MAX, |_| 1.0).is_err());

        let slices = [ChannelSlice { offset: 1, count: usize::MAX }];
        assert_eq!(slices[0].end(), usize::MAX);
        assert!(matches!(
            signal.split_views_mut(&slices),
            Err(SignalError::SliceOutOfRange { offset: 1, .. })
        ));
    }

    #[test]
    fn split_views_write_shared_store() {
        let mut signal = Signal::new(5, 4, 1e-4).unwrap();
        let slices = distribute_channels(5, 2);
        {
            let mut views = signal.split_views_mut(&slices).unwrap();
            for view in views.iter_mut() {
                for ch in view.range() {
                    view.channel_mut(ch).unwrap().fill(ch as f64);
                }
            }
            // A view does not see channels it does not own.
            assert!(views[0].channel_mut(4).is_none());
        }
        for ch in 0..5 {
            assert!(signal.channel(ch).unwrap().iter().all(|&s| s == ch as f64));
        }
    }

    #[test]
    fn split_views_reject_overlap() {
        let mut signal = Signal::new(4, 4, 1e-4).unwrap();
        let slices = [
            ChannelSlice { offset: 0, count: 3 },
            ChannelSlice { offset: 2, count: 2 },
        ];
        assert_eq!(
            signal.split_views_mut(&slices).unwrap_err(),
            SignalError::OverlappingSlices(2)
        );
    }

    #[test]
    fn narrow_then_restore() {
        let mut signal = Signal::new(6, 4, 1e-4).unwrap();
        signal.narrow(0, 2).unwrap();
        assert_eq!(signal.num_channels(), 2);
        assert!(!signal.is_restored());
        signal.restore();
        assert_eq!(signal.offset(), 0);
        assert_eq!(signal.num_channels(), 6);
    }

    #[test]
    fn view_uses_absolute_indices() {
        let mut signal = Signal::new(4, 2, 1e-4).unwrap();
        signal.fill_channel(3, |_| 7.0).unwrap();
        let view = signal.slice(2, 2).unwrap();
        assert_eq!(view.channel(3), Some(&[7.0, 7.0][..]));
        assert_eq!(view.channel(1), None);
        assert_eq!(view.iter().map(|(i, _)| i).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn wav_dump_round_trips_header() {
        let mut signal = Signal::new(2, 8, 1.0 / 8000.0).unwrap();
        signal.fill_channel(0, |i| i as f64 / 8.0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.wav");
        signal.write_wav(&path).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 16);
    }

    proptest! {
        #[test]
        fn distribution_tiles_channels(n in 1usize..256, t in 1usize..32) {
            let slices = distribute_channels(n, t);
            prop_assert!(tiles_exactly(&slices, n));
            prop_assert_eq!(slices.iter().map(|s| s.count).sum::<usize>(), n);
            prop_assert_eq!(slices.len(), t.min(n));
            let base = n / t.min(n);
            for s in &slices[..slices.len() - 1] {
                prop_assert_eq!(s.count, base);
            }
        }
    }
}
