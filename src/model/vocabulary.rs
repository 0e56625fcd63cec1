//! Controlled vocabulary: ontology dimensions, flag types, regions, traditions
//!
//! The vocabulary is fixed at compile time. Out-of-vocabulary tag terms are not
//! errors; they are routed to the pending-vocabulary queue by the proposal sink.

/// The eleven ontology dimensions with their approved terms, in scoring-weight order.
pub const ONTOLOGY: &[(&str, &[&str])] = &[
    (
        "ritual_intent",
        &[
            "healing",
            "protection",
            "purification",
            "fertility_abundance",
            "initiation_transition",
            "divination",
            "spirit_contact",
            "curse_binding",
            "atonement_repair",
            "sovereignty_legitimation",
        ],
    ),
    (
        "ritual_actions",
        &[
            "invocation",
            "chant_recitation",
            "anointing",
            "offering_deposit",
            "fire_operation",
            "water_operation",
            "gesture_sequence",
            "circumambulation",
            "inscription_writing",
            "burial_interment",
        ],
    ),
    (
        "materials_tools",
        &[
            "plant_materia",
            "mineral_materia",
            "animal_materia",
            "vessel_container",
            "blade_tool",
            "cord_binding_material",
            "lamp_flame",
            "tablet_scroll",
            "powder_incense",
            "liquid_elixir",
        ],
    ),
    (
        "invocation_structure",
        &[
            "deity_address",
            "ancestor_address",
            "angelic_hierarchy",
            "spirit_command",
            "formulaic_epithet_sequence",
            "vow_oath_clause",
        ],
    ),
    (
        "time_timing",
        &[
            "seasonal_calendar",
            "lunar_phase",
            "solar_marker",
            "night_operation",
            "dawn_operation",
            "hourly_auspicious_window",
            "life_cycle_event",
        ],
    ),
    (
        "location_setting",
        &[
            "domestic_space",
            "temple_sanctuary",
            "open_landscape",
            "water_edge",
            "burial_site",
            "threshold_crossing",
            "restricted_chamber",
        ],
    ),
    (
        "exchange_offering",
        &[
            "food_offering",
            "liquid_libation",
            "burnt_offering",
            "votive_object",
            "spoken_vow_exchange",
            "service_obligation",
        ],
    ),
    (
        "protection_boundary",
        &[
            "circle_boundary",
            "threshold_marking",
            "name_seal",
            "apotropaic_symbol",
            "protective_text_inscription",
            "guardianship_invocation",
        ],
    ),
    (
        "divination_modality",
        &[
            "lot_casting",
            "dream_incubation",
            "omen_reading",
            "astrological_reading",
            "scrying_surface",
            "mediumship",
        ],
    ),
    (
        "ritual_actors",
        &[
            "specialist_priest",
            "household_practitioner",
            "initiate_group",
            "ruler_state_actor",
            "community_collective",
            "spirit_nonhuman_agent",
        ],
    ),
    (
        "outcome_claim",
        &[
            "material_change",
            "status_change",
            "knowledge_revelation",
            "protection_confirmed",
            "curse_effect_claim",
            "healing_claim",
            "uncertain_or_symbolic",
        ],
    ),
];

pub const FLAG_TYPES: &[&str] = &[
    "uncertain_translation",
    "hostile_source_frame",
    "provenance_gap",
    "date_uncertainty",
    "conflicting_witnesses",
];

pub const UNCERTAIN_TRANSLATION: &str = "uncertain_translation";

pub const REGIONS: &[&str] = &[
    "africa_nile",
    "west_central_asia",
    "south_asia",
    "east_asia",
    "europe_mediterranean",
    "americas_indigenous",
];

pub const TRADITIONS: &[&str] = &[
    "celtic",
    "greek_mystery",
    "zoroastrian",
    "grimoire_tradition",
    "mesopotamian_ritual",
    "vedic_ritual",
    "daoist_ritual",
    "yoruba_orisha",
    "andean_ritual",
    "mesoamerican_ritual",
    "early_jewish_apocalyptic",
    "late_antique_esoteric",
];

/// Language all passages are normalized into for comparison.
pub const CANONICAL_LANGUAGE: &str = "eng";

pub fn is_dimension(dimension: &str) -> bool {
    ONTOLOGY.iter().any(|(name, _)| *name == dimension)
}

/// True if `(dimension, term)` is an approved ontology pair.
pub fn is_approved_term(dimension: &str, term: &str) -> bool {
    ONTOLOGY
        .iter()
        .find(|(name, _)| *name == dimension)
        .map(|(_, terms)| terms.contains(&term))
        .unwrap_or(false)
}

pub fn is_flag_type(flag_type: &str) -> bool {
    FLAG_TYPES.contains(&flag_type)
}

pub fn is_region(region: &str) -> bool {
    REGIONS.contains(&region)
}

pub fn is_tradition(tradition: &str) -> bool {
    TRADITIONS.contains(&tradition)
}

/// Lowercase word parts of every ontology term and tradition tag
/// (`fire_operation` contributes `fire` and `operation`).
pub fn lexicon_parts() -> impl Iterator<Item = &'static str> {
    ONTOLOGY
        .iter()
        .flat_map(|(_, terms)| terms.iter())
        .chain(TRADITIONS.iter())
        .flat_map(|term| term.split('_'))
        .filter(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ontology_has_eleven_dimensions() {
        assert_eq!(ONTOLOGY.len(), 11);
        assert!(is_dimension("ritual_intent"));
        assert!(!is_dimension("ritual_mood"));
    }

    #[test]
    fn approved_terms_are_scoped_to_their_dimension() {
        assert!(is_approved_term("time_timing", "dawn_operation"));
        assert!(!is_approved_term("ritual_intent", "dawn_operation"));
        assert!(!is_approved_term("unknown", "healing"));
    }

    #[test]
    fn metadata_vocabularies() {
        assert!(is_flag_type("uncertain_translation"));
        assert!(!is_flag_type("spelling"));
        assert!(is_region("south_asia"));
        assert!(is_tradition("vedic_ritual"));
        assert!(!is_tradition("vedic"));
    }

    #[test]
    fn lexicon_splits_terms() {
        let parts: Vec<&str> = lexicon_parts().collect();
        assert!(parts.contains(&"dawn"));
        assert!(parts.contains(&"orisha"));
        assert!(!parts.contains(&"dawn_operation"));
    }
}
