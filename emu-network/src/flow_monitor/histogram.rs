/// Fixed-width histogram of non-negative values
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    bin_width: f64,
    bins: Vec<u64>,
}

impl Histogram {
    pub fn new(bin_width: f64) -> Self {
        Self {
            bin_width,
            bins: Vec::new(),
        }
    }

    /// Counts `value` in bin `floor(value / width)`, growing the histogram as needed
    pub fn add_value(&mut self, value: f64) {
        let index = (value.max(0.0) / self.bin_width).floor() as usize;
        if index >= self.bins.len() {
            self.bins.resize(index + 1, 0);
        }

        self.bins[index] += 1;
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    pub fn n_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn bin_count(&self, index: usize) -> u64 {
        self.bins.get(index).copied().unwrap_or(0)
    }

    pub fn bin_start(&self, index: usize) -> f64 {
        index as f64 * self.bin_width
    }

    /// `(index, count)` of every bin holding at least one value
    pub fn non_empty_bins(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.bins
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, count)| count > 0)
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_values_land_in_floor_bins() {
        let mut histogram = Histogram::new(0.001);
        histogram.add_value(0.0);
        histogram.add_value(0.0205);
        histogram.add_value(0.0209);
        histogram.add_value(0.5005);

        assert_eq!(histogram.n_bins(), 501);
        assert_eq!(histogram.bin_count(0), 1);
        assert_eq!(histogram.bin_count(20), 2);
        assert_eq!(histogram.bin_count(500), 1);
        assert_eq!(histogram.total(), 4);

        let bins: Vec<_> = histogram.non_empty_bins().collect();
        assert_eq!(bins, [(0, 1), (20, 2), (500, 1)]);
    }

    #[test]
    fn test_packet_size_bins() {
        let mut histogram = Histogram::new(20.0);
        histogram.add_value(33.0);
        histogram.add_value(1500.0);
        assert_eq!(histogram.bin_count(1), 1);
        assert_eq!(histogram.bin_count(75), 1);
        assert_eq!(histogram.bin_start(75), 1500.0);
    }
}
