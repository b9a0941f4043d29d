use volscan_domain::errors::PipelineError;
use volscan_domain::repositories::time_series::TimeSeriesStore;
use volscan_domain::value_objects::symbol::Symbol;

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRank {
    pub symbol: Symbol,
    pub volume: f64,
}

impl VolumeRank {
    pub fn volume_millions(&self) -> f64 {
        self.volume / 1_000_000.0
    }
}

/// Symbols with the largest summed volume over the `lookback_secs` before `now`.
pub async fn top_volume_report(
    store: &dyn TimeSeriesStore,
    now: i64,
    lookback_secs: i64,
    top_n: usize,
) -> Result<Vec<VolumeRank>, PipelineError> {
    if top_n == 0 {
        return Ok(Vec::new());
    }
    let ranked = store.top_volume(now - lookback_secs, top_n).await?;
    Ok(ranked
        .into_iter()
        .take(top_n)
        .map(|(symbol, volume)| VolumeRank { symbol, volume })
        .collect())
}

/// One line per symbol, volumes in millions.
pub fn render_report(ranks: &[VolumeRank]) -> String {
    ranks
        .iter()
        .enumerate()
        .map(|(idx, rank)| {
            format!(
                "{:>2}. {:<16} {:>10.2}M",
                idx + 1,
                rank.symbol.as_str(),
                rank.volume_millions()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
