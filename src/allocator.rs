// src/allocator.rs
// ALLOCATOR: panel weights -> integer respondent draws per persona.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SsrError};
use crate::persona::Panel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    PerPersona,
    Stratified,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub mode: AllocationMode,
    /// Draw count per persona, in panel order.
    pub draws: Vec<usize>,
}

impl Allocation {
    pub fn total(&self) -> usize {
        self.draws.iter().sum()
    }

    /// `(persona_index, draw_index)` pairs in dispatch order.
    pub fn respondents(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.draws
            .iter()
            .enumerate()
            .flat_map(|(persona, &count)| (0..count).map(move |draw| (persona, draw)))
    }
}

/// Same `n` for every persona.
pub fn allocate_per_persona(panel: &Panel, n: usize) -> Allocation {
    Allocation {
        mode: AllocationMode::PerPersona,
        draws: vec![n; panel.len()],
    }
}

/// Largest-remainder apportionment of `total_n` draws by weight.
/// Ties on the fractional part go to the earlier persona.
pub fn allocate_stratified(weights: &[f64], total_n: usize) -> Vec<usize> {
    let quotas: Vec<f64> = weights.iter().map(|w| w.max(0.0) * total_n as f64).collect();
    let mut draws: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();

    let assigned: usize = draws.iter().sum();
    if assigned > total_n {
        // Only reachable through rounding on weights summing above one.
        let mut excess = assigned - total_n;
        for draw in draws.iter_mut().rev() {
            let take = excess.min(*draw);
            *draw -= take;
            excess -= take;
            if excess == 0 {
                break;
            }
        }
        return draws;
    }

    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = quotas[a] - quotas[a].floor();
        let rb = quotas[b] - quotas[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let mut remaining = total_n - assigned;
    for &index in order.iter().cycle() {
        if remaining == 0 {
            break;
        }
        draws[index] += 1;
        remaining -= 1;
    }
    draws
}

/// Chooses the allocation mode from the request sizing fields:
/// `total_n` wins, then the `stratified` flag over `n`, else `n` per persona.
pub fn allocate(panel: &Panel, n: usize, total_n: Option<usize>, stratified: bool) -> Result<Allocation> {
    let allocation = match total_n {
        Some(0) => return Err(SsrError::validation("total_n must be at least 1")),
        Some(total) => Allocation {
            mode: AllocationMode::Stratified,
            draws: allocate_stratified(&panel.weights(), total),
        },
        None if n == 0 => return Err(SsrError::validation("n must be at least 1")),
        None if stratified => Allocation {
            mode: AllocationMode::Stratified,
            draws: allocate_stratified(&panel.weights(), n),
        },
        None => allocate_per_persona(panel, n),
    };
    info!(mode = ?allocation.mode, respondents = allocation.total(), personas = panel.len(), "draws allocated");
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    fn panel(weights: &[f64]) -> Panel {
        Panel::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| Persona::new(&format!("P{i}")).with_weight(*w))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn stratified_matches_weights_exactly() {
        let allocation = allocate(&panel(&[0.5, 0.3, 0.2]), 10, Some(200), false).unwrap();
        assert_eq!(allocation.mode, AllocationMode::Stratified);
        assert_eq!(allocation.draws, vec![100, 60, 40]);
    }

    #[test]
    fn remainders_go_to_largest_fraction_then_panel_order() {
        let draws = allocate_stratified(&[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], 10);
        assert_eq!(draws, vec![4, 3, 3]);
        let draws = allocate_stratified(&[0.15, 0.25, 0.6], 3);
        assert_eq!(draws.iter().sum::<usize>(), 3);
        assert_eq!(draws, vec![0, 1, 2]);
    }

    #[test]
    fn stratified_flag_uses_n_as_total() {
        let allocation = allocate(&panel(&[0.25, 0.75]), 8, None, true).unwrap();
        assert_eq!(allocation.draws, vec![2, 6]);
    }

    #[test]
    fn per_persona_mode_repeats_n() {
        let allocation = allocate(&panel(&[0.9, 0.1]), 3, None, false).unwrap();
        assert_eq!(allocation.mode, AllocationMode::PerPersona);
        assert_eq!(allocation.draws, vec![3, 3]);
        let respondents: Vec<(usize, usize)> = allocation.respondents().collect();
        assert_eq!(respondents, [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(allocate(&panel(&[1.0]), 0, None, false).is_err());
        assert!(allocate(&panel(&[1.0]), 5, Some(0), false).is_err());
    }
}
