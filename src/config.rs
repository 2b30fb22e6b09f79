/// Tunables for composing producer chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeConfig {
    /// How many levels of producers a single normalization inlines. A normalizer at depth
    /// `d` (the outermost being 1) inlines its producers only while `d <= max_apply_depth`.
    pub max_apply_depth: usize,
    /// The most single-step compositions a fixed-point composition attempts before giving
    /// up.
    pub max_compose_iterations: usize,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        ComposeConfig {
            max_apply_depth: 1,
            max_compose_iterations: 64,
        }
    }
}
