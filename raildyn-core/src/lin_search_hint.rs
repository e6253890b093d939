use crate::imports::*;

/// Sweep direction hint for hinted linear search through sorted spatial
/// tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    #[default]
    Unk,
    Fwd,
    Bwd,
}

/// Has a spatial offset along the track.
pub trait GetOffset {
    fn get_offset(&self) -> si::Length;
}

/// Hinted linear search over a slice sorted by offset. When the caller
/// tracks a previous index and sweep direction, lookups for slowly moving
/// followers are O(1) instead of O(log n).
pub trait LinSearchHint {
    fn calc_idx(&self, offset: si::Length, idx: usize, dir: &Dir) -> anyhow::Result<usize>;
}

impl<T: GetOffset> LinSearchHint for &[T] {
    fn calc_idx(&self, offset: si::Length, mut idx: usize, dir: &Dir) -> anyhow::Result<usize> {
        ensure!(
            self.len() >= 2,
            "{}\nMust have at least 2 elements!",
            format_dbg!()
        );
        ensure!(
            self.first().unwrap().get_offset() <= offset
                && offset <= self.last().unwrap().get_offset(),
            "{}\nOffset in meters = {:?} must be within table bounds!",
            format_dbg!(),
            offset.get::<si::meter>()
        );
        if dir != &Dir::Bwd {
            while self[idx + 1].get_offset() < offset {
                idx += 1;
            }
        }
        if dir != &Dir::Fwd {
            while self[idx].get_offset() > offset {
                idx -= 1;
            }
        }
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uc;

    struct Pt(si::Length);
    impl GetOffset for Pt {
        fn get_offset(&self) -> si::Length {
            self.0
        }
    }

    #[test]
    fn test_calc_idx() {
        let pts = vec![Pt(0.0 * uc::M), Pt(100.0 * uc::M), Pt(250.0 * uc::M)];
        let slice = pts.as_slice();
        assert_eq!(slice.calc_idx(50.0 * uc::M, 0, &Dir::Unk).unwrap(), 0);
        assert_eq!(slice.calc_idx(150.0 * uc::M, 0, &Dir::Fwd).unwrap(), 1);
        assert_eq!(slice.calc_idx(50.0 * uc::M, 2, &Dir::Bwd).unwrap(), 0);
        assert!(slice.calc_idx(300.0 * uc::M, 0, &Dir::Unk).is_err());
    }
}
