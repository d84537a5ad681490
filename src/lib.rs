//! Automatic calibration of speaker arrays.
//!
//! A calibration session plays a band-limited pink-noise stimulus from the
//! direction of every speaker of a layout, one at a time, and captures it
//! with one or more reference microphones. From the captures it derives a
//! correction filter per speaker (a few peaking biquads that flatten the
//! response relative to an ideal omni reference) and a gain per speaker that
//! brings every speaker to the level of the quietest one. Subwoofers are
//! measured separately in their own frequency range. The result, together
//! with the reference level and the diffuse-field gain, is written back into
//! the layout file with a date, a checksum and the measurement parameters
//! used.
//!
//! The rendering itself is done by a [`RenderEngine`](engine::RenderEngine).
//! The crate ships a [simulated engine](sim_engine) with a seeded room, which
//! both binaries run on.
//!
//! Two binaries are built: `spkcalib` calibrates a layout in one go and
//! verifies calibrated layouts, `calibmonitor` is an interactive terminal
//! console for the whole calibration workflow.

#![warn(missing_docs)]
pub mod args;
pub mod attr_decoder;
pub mod calib_session;
pub mod component;
pub mod engine;
pub mod error;
pub mod gui;
pub mod layout;
pub mod measurement;
pub mod normalization;
pub mod params;
pub mod peq;
pub mod persistence;
pub mod recording_writer;
pub mod sim_engine;
pub mod spectrum;
pub mod stimulus;

/// Iterates a collection of equally long sequences column by column, e.g.
/// per-microphone band levels as per-band microphone levels. Stops at the
/// end of the shortest sequence, and immediately when there are none.
pub struct TransposeIter<I, T>
where
    I: IntoIterator<Item = T>,
{
    iterators: Vec<I::IntoIter>,
}

#[allow(missing_docs)]
pub trait TransposableIter<I, T>
where
    Self: Sized,
    Self: IntoIterator<Item = I>,
    I: IntoIterator<Item = T>,
{
    fn transpose(self) -> TransposeIter<I, T> {
        let iterators: Vec<_> = self.into_iter().map(|i| i.into_iter()).collect();
        TransposeIter { iterators }
    }
}

impl<I, T> Iterator for TransposeIter<I, T>
where
    I: IntoIterator<Item = T>,
{
    type Item = Vec<T>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.iterators.is_empty() {
            return None;
        }
        self.iterators.iter_mut().map(|iter| iter.next()).collect()
    }
}

impl<I, T, Any> TransposableIter<I, T> for Any
where
    Any: IntoIterator<Item = I>,
    I: IntoIterator<Item = T>,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_of_band_levels() {
        let per_mic = vec![vec![60.0, 62.0, 64.0], vec![61.0, 63.0, 65.0]];
        let per_band: Vec<Vec<f64>> = per_mic.transpose().collect();
        assert_eq!(per_band, vec![vec![60.0, 61.0], vec![62.0, 63.0], vec![64.0, 65.0]]);
    }

    #[test]
    fn shortest_row_ends_it() {
        let rows = vec![vec![1, 2, 3], vec![4]];
        assert_eq!(rows.transpose().count(), 1);
    }

    #[test]
    fn no_rows_no_columns() {
        let rows: Vec<Vec<f64>> = Vec::new();
        assert_eq!(rows.transpose().next(), None);
    }
}
