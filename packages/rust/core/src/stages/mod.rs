//! The built-in stages and the fixed plan that orders them.
//!
//! The order is static. Dependencies between stages are declared on each
//! [`StageSpec`] and asserted at runtime by [`crate::stage::run_isolated`];
//! nothing here sorts or reorders.

mod broad_search;
mod comparables;
mod narrative;
mod reconciliation;
mod structured;
mod valuation;

use std::sync::Arc;

use appraisal_shared::{NarrativeSection, PipelineSettings, Section, ValuationMethod};

use crate::collaborator::{Collaborator, Collaborators};
use crate::stage::{Stage, StageSpec};

pub use broad_search::{BroadSearchPayload, BroadSearchStage, SearchField};
pub use comparables::{ComparableSalesStage, SalesPayload};
pub use narrative::{NarrativePayload, NarrativeStage};
pub use reconciliation::{ReconciliationPayload, ReconciliationStage, reconcile};
pub use structured::{ParcelLookup, StructuredLookupStage};
pub use valuation::{ValuationPayload, ValuationStage};

/// Status-map keys, in plan order.
pub mod names {
    pub const STRUCTURED_LOOKUP: &str = "structured_lookup";
    pub const BROAD_SEARCH: &str = "broad_search";
    pub const COMPARABLE_SALES: &str = "comparable_sales";
    pub const SITE_DESCRIPTION: &str = "site_description";
    pub const MARKET_ANALYSIS: &str = "market_analysis";
    pub const HIGHEST_AND_BEST_USE: &str = "highest_and_best_use";
    pub const SALES_COMPARISON: &str = "sales_comparison";
    pub const INCOME_APPROACH: &str = "income_approach";
    pub const COST_APPROACH: &str = "cost_approach";
    pub const RECONCILIATION: &str = "reconciliation";
    pub const CERTIFICATION: &str = "certification";
    pub const SUMMARY: &str = "summary";
    pub const TRANSMITTAL: &str = "transmittal";

    pub const ALL: [&str; 13] = [
        STRUCTURED_LOOKUP,
        BROAD_SEARCH,
        COMPARABLE_SALES,
        SITE_DESCRIPTION,
        MARKET_ANALYSIS,
        HIGHEST_AND_BEST_USE,
        SALES_COMPARISON,
        INCOME_APPROACH,
        COST_APPROACH,
        RECONCILIATION,
        CERTIFICATION,
        SUMMARY,
        TRANSMITTAL,
    ];
}

fn narrative(section: NarrativeSection) -> Section {
    Section::Narrative(section)
}

fn valuation(method: ValuationMethod) -> Section {
    Section::Valuation(method)
}

/// Build the thirteen-stage appraisal plan.
pub fn standard_plan(
    collaborators: &Collaborators,
    settings: &PipelineSettings,
) -> Vec<Box<dyn Stage>> {
    use NarrativeSection as N;
    use ValuationMethod as V;
    use names::*;

    let shared = || -> Arc<dyn Collaborator> { Arc::clone(&collaborators.shared) };

    let summary_spec = {
        let mut spec = StageSpec::new(SUMMARY)
            .requires(Section::Identity)
            .reads(Section::Attributes)
            .reads(Section::Comparables);
        for section in [
            N::SiteDescription,
            N::MarketAnalysis,
            N::HighestAndBestUse,
            N::ValuationApproaches,
            N::Reconciliation,
            N::Certification,
        ] {
            spec = spec.reads(narrative(section));
        }
        for method in V::ALL {
            spec = spec.reads(valuation(method));
        }
        spec.reads(Section::Reconciled).writes(narrative(N::Summary))
    };

    vec![
        Box::new(StructuredLookupStage::new(
            collaborators.structured(),
            settings.structured_label.clone(),
        )),
        Box::new(BroadSearchStage::new(shared())),
        Box::new(ComparableSalesStage::new(
            shared(),
            settings.years_back,
            settings.default_number_of_comps,
        )),
        Box::new(NarrativeStage::new(
            StageSpec::new(SITE_DESCRIPTION)
                .requires(Section::Attributes)
                .writes(narrative(N::SiteDescription)),
            N::SiteDescription,
            shared(),
        )),
        Box::new(NarrativeStage::new(
            StageSpec::new(MARKET_ANALYSIS)
                .requires(Section::Identity)
                .reads(Section::Comparables)
                .writes(narrative(N::MarketAnalysis)),
            N::MarketAnalysis,
            shared(),
        )),
        Box::new(NarrativeStage::new(
            StageSpec::new(HIGHEST_AND_BEST_USE)
                .requires(narrative(N::SiteDescription))
                .reads(narrative(N::MarketAnalysis))
                .reads(Section::Attributes)
                .writes(narrative(N::HighestAndBestUse)),
            N::HighestAndBestUse,
            shared(),
        )),
        Box::new(ValuationStage::new(
            StageSpec::new(SALES_COMPARISON)
                .requires(Section::Comparables)
                .reads(Section::Attributes)
                .reads(narrative(N::HighestAndBestUse))
                .writes(valuation(V::SalesComparison)),
            V::SalesComparison,
            shared(),
        )),
        Box::new(ValuationStage::new(
            StageSpec::new(INCOME_APPROACH)
                .requires(Section::Identity)
                .reads(Section::Attributes)
                .reads(Section::Comparables)
                .reads(narrative(N::MarketAnalysis))
                .writes(valuation(V::Income)),
            V::Income,
            shared(),
        )),
        Box::new(ValuationStage::new(
            StageSpec::new(COST_APPROACH)
                .requires(Section::Attributes)
                .reads(Section::Comparables)
                .writes(valuation(V::Cost)),
            V::Cost,
            shared(),
        )),
        Box::new(ReconciliationStage::new(shared())),
        Box::new(NarrativeStage::new(
            StageSpec::new(CERTIFICATION)
                .requires(Section::Identity)
                .reads(Section::Reconciled)
                .writes(narrative(N::Certification)),
            N::Certification,
            shared(),
        )),
        Box::new(NarrativeStage::new(summary_spec, N::Summary, shared())),
        Box::new(NarrativeStage::new(
            StageSpec::new(TRANSMITTAL)
                .requires(Section::Identity)
                .reads(narrative(N::Summary))
                .reads(Section::Reconciled)
                .writes(narrative(N::Transmittal)),
            N::Transmittal,
            shared(),
        )),
    ]
}
