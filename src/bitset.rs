//! Compact bitset representation for branch sets on a phylogeny.
//!
//! # Overview
//! Every branch of a canonical tree has a zero-based index. A bitset records
//! which branches belong to a set (a foreground set, an ancestor set, ...).
//! Bit `i` corresponds to branch index `i`.
//!
//! # Example
//! For a tree with branches [A, B, <2>, C, D, <5>] mapped to indices [0..6):
//! - Gain set {<2>, C} → bitset `0b001100` (bits 2 and 3 set)
//! - Descendants of <2> → bitset `0b000111` (bits 0, 1, 2 set)

/// A fixed-width bitset over branch indices.
///
/// Internally stores bits in `Vec<u64>` words so trees of any size can be
/// addressed. Each u64 word holds 64 branch indices. All sets built for the
/// same tree share the same word count.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words needed. Calculate as `num_branches.div_ceil(64)`
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// // For a tree with 100 branches, need 2 words (128 bits)
    /// let bs = Bitset::zeros(2);
    /// assert_eq!(bs.0.len(), 2);
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Creates an empty bitset wide enough for `len` indices.
    pub fn with_len(len: usize) -> Self {
        Self::zeros(len.div_ceil(64))
    }

    /// Creates a bitset with exactly the bits `0..len` set.
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let all = Bitset::full(70);
    /// assert_eq!(all.count_ones(), 70);
    /// assert_eq!(all.0[1], 0b111111);
    /// ```
    pub fn full(len: usize) -> Self {
        let mut bs = Self::with_len(len);
        let whole = len >> 6;
        for w in bs.0.iter_mut().take(whole) {
            *w = u64::MAX;
        }
        let rem = len & 63;
        if rem > 0 {
            bs.0[whole] = (1u64 << rem) - 1;
        }
        bs
    }

    /// Sets the bit at the given index to 1.
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(5);
    /// assert_eq!(bs.0[0], 0b00100001);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6; // Equivalent to idx / 64
        let bit = idx & 63; // Equivalent to idx % 64
        self.0[word] |= 1u64 << bit;
    }

    /// Returns true when the bit at `idx` is set. Out-of-range indices are unset.
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx >> 6)
            .is_some_and(|w| (w >> (idx & 63)) & 1 == 1)
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut left = Bitset::zeros(1);
    /// left.set(0);   // {0}
    ///
    /// let mut right = Bitset::zeros(1);
    /// right.set(1);  // {1}
    ///
    /// left.or_assign(&right);  // {0} ∪ {1} = {0, 1}
    /// assert_eq!(left.0[0], 0b11);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Intersection in place: `self` becomes `self ∩ other`.
    #[inline]
    pub fn and_assign(&mut self, other: &Bitset) {
        for (i, a) in self.0.iter_mut().enumerate() {
            *a &= other.0.get(i).copied().unwrap_or(0);
        }
    }

    /// Difference in place: `self` becomes `self \ other`.
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut desc = Bitset::zeros(1);
    /// desc.0[0] = 0b0111;
    /// let mut gain = Bitset::zeros(1);
    /// gain.set(2);
    /// desc.and_not_assign(&gain);
    /// assert_eq!(desc.0[0], 0b0011);
    /// ```
    #[inline]
    pub fn and_not_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a &= !*b;
        }
    }

    /// Returns true when the two sets share at least one bit.
    #[inline]
    pub fn intersects(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).any(|(a, b)| a & b != 0)
    }

    /// Counts the number of set bits (population count).
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(2);
    /// bs.set(5);
    /// assert_eq!(bs.count_ones(), 3);
    /// ```
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true when no bit is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Iterates set bit indices in ascending order.
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut bs = Bitset::zeros(2);
    /// bs.set(70);
    /// bs.set(3);
    /// assert_eq!(bs.iter_ones().collect::<Vec<_>>(), vec![3, 70]);
    /// ```
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + Clone + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1; // drop lowest set bit
                Some((w << 6) + bit)
            })
        })
    }

    /// Lowercase hexadecimal rendering of the set as one big integer
    /// (branch 0 is the least significant bit). The empty set renders as `"0"`.
    ///
    /// # Example
    /// ```
    /// # use permucn::bitset::Bitset;
    /// let mut bs = Bitset::zeros(2);
    /// bs.set(1);
    /// bs.set(64);
    /// assert_eq!(bs.to_hex(), "10000000000000002");
    /// assert_eq!(Bitset::zeros(2).to_hex(), "0");
    /// ```
    pub fn to_hex(&self) -> String {
        let Some(top) = self.0.iter().rposition(|w| *w != 0) else {
            return "0".to_string();
        };
        let mut out = format!("{:x}", self.0[top]);
        for w in self.0[..top].iter().rev() {
            out.push_str(&format!("{:016x}", w));
        }
        out
    }

    /// Parses the rendering produced by [`Bitset::to_hex`] into a bitset of
    /// `words` words. An empty string is the empty set.
    ///
    /// Returns `None` on non-hex input or when set bits do not fit in `words`.
    pub fn from_hex(text: &str, words: usize) -> Option<Bitset> {
        let text = text.trim();
        let mut bs = Bitset::zeros(words);
        let digits = text.as_bytes();
        let mut end = digits.len();
        let mut word = 0usize;
        while end > 0 {
            let start = end.saturating_sub(16);
            let chunk = std::str::from_utf8(&digits[start..end]).ok()?;
            let value = u64::from_str_radix(chunk, 16).ok()?;
            if word < words {
                bs.0[word] = value;
            } else if value != 0 {
                return None;
            }
            word += 1;
            end = start;
        }
        Some(bs)
    }
}
