use crate::job::Info;
use bit_vec::BitVec;

/// Which pieces we have, which are in flight, and how common each one is.
#[derive(Debug)]
pub struct PiecePicker {
    have: BitVec,
    pending: BitVec,
    availability: Vec<u32>,
    piece_length: u64,
    total: u64,
    done_bytes: u64,
}

impl PiecePicker {
    pub fn new(info: &Info) -> Self {
        let count = info.piece_count();
        PiecePicker {
            have: BitVec::from_elem(count, false),
            pending: BitVec::from_elem(count, false),
            availability: vec![0; count],
            piece_length: info.piece_length,
            total: info.total_length(),
            done_bytes: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.have.len()
    }

    pub fn has(&self, index: usize) -> bool {
        self.have.get(index).unwrap_or(false)
    }

    pub fn done_bytes(&self) -> u64 {
        self.done_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    fn piece_size(&self, index: usize) -> u64 {
        self.total
            .saturating_sub(index as u64 * self.piece_length)
            .min(self.piece_length)
    }

    /// Counts every piece set in a peer's bitfield. Extra trailing bits are ignored.
    pub fn add_peer(&mut self, bits: &BitVec) {
        for (i, count) in self.availability.iter_mut().enumerate() {
            if bits.get(i).unwrap_or(false) {
                *count += 1;
            }
        }
    }

    pub fn remove_peer(&mut self, bits: &BitVec) {
        for (i, count) in self.availability.iter_mut().enumerate() {
            if bits.get(i).unwrap_or(false) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn peer_has(&mut self, index: usize) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    /// Whether the peer owns anything we still need.
    pub fn wants_any(&self, bits: &BitVec) -> bool {
        (0..self.piece_count()).any(|i| !self.has(i) && bits.get(i).unwrap_or(false))
    }

    /// Reserves the next piece to fetch from a peer owning `bits`.
    /// Sequential mode takes the lowest index, otherwise the rarest piece wins
    /// with ties going to the lower index.
    pub fn pick(&mut self, bits: &BitVec, sequential: bool) -> Option<usize> {
        let candidates = (0..self.piece_count()).filter(|&i| {
            !self.have[i] && !self.pending[i] && bits.get(i).unwrap_or(false)
        });
        let picked = match sequential {
            true => candidates.min(),
            false => candidates.min_by_key(|&i| (self.availability[i], i)),
        };
        let picked = picked?;
        self.pending.set(picked, true);
        Some(picked)
    }

    /// Gives a reserved piece back, e.g. when its peer went away.
    pub fn release(&mut self, index: usize) {
        if index < self.piece_count() {
            self.pending.set(index, false);
        }
    }

    /// Marks a verified piece as ours. Returns false if it already was.
    pub fn complete(&mut self, index: usize) -> bool {
        if index >= self.piece_count() || self.have[index] {
            return false;
        }
        self.pending.set(index, false);
        self.have.set(index, true);
        self.done_bytes += self.piece_size(index);
        true
    }

    pub fn bitfield(&self) -> &BitVec {
        &self.have
    }
}
