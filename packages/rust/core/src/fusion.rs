//! Source fusion: choose one value per field among competing estimates.
//!
//! [`resolve`] ranks candidates by confidence, breaking ties by source
//! priority and then by arrival order. [`merge_attribute`] applies the
//! result to the record's attribute map, honouring user overrides and the
//! authoritative-source threshold, and returns the audit entry.
//! [`merge_section`] does the same for whole sections written by later
//! stages, so a re-run never swaps in a weaker section.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use appraisal_shared::{Attribute, FieldValue, FusionDecision, FusionRule, Provenance, SourceKind};

/// One estimate of a field's value from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: Option<FieldValue>,
    pub provenance: Provenance,
    pub confidence: f64,
}

impl Candidate {
    pub fn new(value: FieldValue, provenance: Provenance, confidence: f64) -> Self {
        Self {
            value: Some(value),
            provenance,
            confidence,
        }
    }

    /// A candidate survives when it has a value and a strictly positive
    /// confidence. NaN never survives.
    pub fn survives(&self) -> bool {
        self.value.is_some() && self.confidence > 0.0
    }

    fn into_attribute(self) -> Option<Attribute> {
        let value = self.value?;
        Some(Attribute {
            value,
            provenance: self.provenance,
            confidence: self.confidence,
        })
    }
}

impl From<Attribute> for Candidate {
    fn from(attr: Attribute) -> Self {
        Self {
            value: Some(attr.value),
            provenance: attr.provenance,
            confidence: attr.confidence,
        }
    }
}

/// Outcome of ranking a set of candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    /// `None` when no candidate survived.
    pub winner: Option<Attribute>,
    /// Position of the winner in the input list.
    pub winner_index: Option<usize>,
    /// Surviving candidates that lost, best first.
    pub rejected: Vec<Attribute>,
    /// True when a rejected candidate carried a different value.
    pub conflict: bool,
}

impl Fused {
    /// Confidence of the winner, or 0 when absent.
    pub fn confidence(&self) -> f64 {
        self.winner.as_ref().map_or(0.0, |w| w.confidence)
    }
}

/// Pick the winning candidate.
///
/// Candidates without a value or with confidence `<= 0` are discarded. The
/// rest are ordered by confidence descending, then source priority
/// descending; remaining ties keep input order.
pub fn resolve(candidates: Vec<Candidate>) -> Fused {
    let mut ranked: Vec<(usize, Attribute)> = candidates
        .into_iter()
        .enumerate()
        .filter(|(_, c)| c.survives())
        .filter_map(|(i, c)| c.into_attribute().map(|a| (i, a)))
        .collect();

    // `sort_by` is stable, so equal keys keep arrival order.
    ranked.sort_by(|(_, a), (_, b)| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.provenance.kind.priority().cmp(&a.provenance.kind.priority()))
    });

    let mut iter = ranked.into_iter();
    let Some((winner_index, winner)) = iter.next() else {
        return Fused {
            winner: None,
            winner_index: None,
            rejected: Vec::new(),
            conflict: false,
        };
    };

    let rejected: Vec<Attribute> = iter.map(|(_, a)| a).collect();
    let conflict = rejected.iter().any(|r| r.value != winner.value);

    Fused {
        winner: Some(winner),
        winner_index: Some(winner_index),
        rejected,
        conflict,
    }
}

/// Mean confidence of the surviving candidates, `None` if none survive.
pub fn aggregate_confidence<'a>(candidates: impl IntoIterator<Item = &'a Candidate>) -> Option<f64> {
    appraisal_shared::record::mean(
        candidates
            .into_iter()
            .filter(|c| c.survives())
            .map(|c| c.confidence),
    )
}

/// How incoming candidates may interact with values already in the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeMode {
    /// Existing and incoming values compete on confidence.
    Competitive,
    /// Incoming values fill gaps and may only replace existing values whose
    /// confidence is below `threshold`.
    Supplementary { threshold: f64 },
}

/// Fuse `incoming` candidates for `field` into `attributes`.
///
/// Returns the audit entry, or `None` when nothing survived and the field
/// was left untouched.
pub fn merge_attribute(
    attributes: &mut BTreeMap<String, Attribute>,
    field: &str,
    incoming: Vec<Candidate>,
    stage: &str,
    mode: MergeMode,
) -> Option<FusionDecision> {
    let existing = attributes.get(field).cloned();

    if let Some(current) = existing {
        if !incoming.iter().any(Candidate::survives) {
            return None;
        }

        let protected_by = if current.provenance.kind == SourceKind::UserOverride {
            Some(FusionRule::OverrideLocked)
        } else {
            match mode {
                MergeMode::Supplementary { threshold } if current.confidence >= threshold => {
                    Some(FusionRule::AuthoritativeKept)
                }
                _ => None,
            }
        };

        if let Some(rule) = protected_by {
            let challengers = resolve(incoming);
            let mut rejected = challengers.rejected;
            if let Some(w) = challengers.winner {
                rejected.insert(0, w);
            }
            if rejected.is_empty() {
                return None;
            }
            let conflict = rejected.iter().any(|r| r.value != current.value);
            debug!(field, stage, ?rule, "existing value kept");
            return Some(FusionDecision {
                field: field.to_string(),
                stage: stage.to_string(),
                rule,
                winner: current.provenance.clone(),
                winner_confidence: current.confidence,
                displaced: None,
                rejected,
                conflict,
            });
        }

        let mut candidates = Vec::with_capacity(incoming.len() + 1);
        candidates.push(Candidate::from(current.clone()));
        candidates.extend(incoming);
        let fused = resolve(candidates);
        let winner = fused.winner?;

        let replaced = fused.winner_index != Some(0);
        let mut rejected = fused.rejected;
        if replaced {
            // The previous value is reported as displaced, not rejected.
            if let Some(pos) = rejected.iter().position(|r| *r == current) {
                rejected.remove(pos);
            }
        }

        if fused.conflict {
            warn!(
                field,
                stage,
                winner = %winner.provenance.label,
                confidence = winner.confidence,
                "fusion conflict"
            );
        }

        let decision = FusionDecision {
            field: field.to_string(),
            stage: stage.to_string(),
            rule: FusionRule::Ranked,
            winner: winner.provenance.clone(),
            winner_confidence: winner.confidence,
            displaced: replaced.then(|| current.clone()),
            rejected,
            conflict: fused.conflict,
        };
        if replaced {
            attributes.insert(field.to_string(), winner);
        }
        debug!(field, stage, replaced, "field ranked");
        return Some(decision);
    }

    let fused = resolve(incoming);
    let winner = fused.winner?;
    if fused.conflict {
        warn!(
            field,
            stage,
            winner = %winner.provenance.label,
            confidence = winner.confidence,
            "fusion conflict"
        );
    }
    let decision = FusionDecision {
        field: field.to_string(),
        stage: stage.to_string(),
        rule: FusionRule::Inserted,
        winner: winner.provenance.clone(),
        winner_confidence: winner.confidence,
        displaced: None,
        rejected: fused.rejected,
        conflict: fused.conflict,
    };
    attributes.insert(field.to_string(), winner);
    debug!(field, stage, "field inserted");
    Some(decision)
}

/// Fuse a whole record section, summarized as an [`Attribute`], against the
/// one already in place.
///
/// An empty slot always takes the incoming section. Otherwise the two rank
/// like attribute candidates with the current section first, so a tie keeps
/// it. Returns whether the caller should replace the section, and the audit
/// entry.
pub fn merge_section(
    current: Option<Attribute>,
    incoming: Attribute,
    section: &str,
    stage: &str,
) -> (bool, FusionDecision) {
    let Some(current) = current else {
        debug!(section, stage, "section inserted");
        return (
            true,
            FusionDecision {
                field: section.to_string(),
                stage: stage.to_string(),
                rule: FusionRule::Inserted,
                winner: incoming.provenance,
                winner_confidence: incoming.confidence,
                displaced: None,
                rejected: Vec::new(),
                conflict: false,
            },
        );
    };

    if current.provenance.kind == SourceKind::UserOverride {
        let conflict = incoming.value != current.value;
        debug!(section, stage, "section locked by override");
        return (
            false,
            FusionDecision {
                field: section.to_string(),
                stage: stage.to_string(),
                rule: FusionRule::OverrideLocked,
                winner: current.provenance,
                winner_confidence: current.confidence,
                displaced: None,
                rejected: vec![incoming],
                conflict,
            },
        );
    }

    let fused = resolve(vec![
        Candidate::from(current.clone()),
        Candidate::from(incoming.clone()),
    ]);
    let replaced = fused.winner_index == Some(1);
    let conflict = incoming.value != current.value;
    let (winner, displaced, rejected) = if replaced {
        (incoming, Some(current), Vec::new())
    } else {
        (current, None, vec![incoming])
    };

    debug!(
        section,
        stage,
        replaced,
        confidence = winner.confidence,
        "section ranked"
    );
    (
        replaced,
        FusionDecision {
            field: section.to_string(),
            stage: stage.to_string(),
            rule: FusionRule::Ranked,
            winner: winner.provenance,
            winner_confidence: winner.confidence,
            displaced,
            rejected,
            conflict,
        },
    )
}
