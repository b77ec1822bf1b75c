use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Nicely styled progress bar over an iterator. The const generic picks the
/// bar color: 'b' (blue), 'g' (green), or 'r' (red).
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(
    pub T,
    pub &'static str,
);

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let color = match COLOR {
            'b' => "blue",
            'g' => "green",
            'r' => "red",
            other => panic!("unexpected progress bar color `{other}`"),
        };
        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})",
                    self.1
                ))
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );
        self.0.progress_with(bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_iterates_everything() {
        let items: Vec<usize> = NiceProgressBar::<_, 'g'>(0..5, "Testing")
            .into_iter()
            .collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }
}
