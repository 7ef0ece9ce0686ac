//! Canonical survey schema and header alias resolution.
//!
//! The survey form has been published in Spanish and English, and the
//! spreadsheet export keeps whatever header text the form used. Every source
//! table goes through [`normalize`] before anything else looks at it.

use crate::table::Table;

/// The 15 canonical fields, in storage order.
pub const CANONICAL_FIELDS: [&str; 15] = [
    "timestamp",
    "age",
    "identity",
    "orientation",
    "platform",
    "play_frequency",
    "favorite_genre",
    "player_gender",
    "representation_rating",
    "orientation_importance",
    "inclusive_interest",
    "customization_importance",
    "harassment_experience",
    "community_feeling",
    "recommendation",
];

/// Natural key of a survey response.
pub const TIMESTAMP: &str = "timestamp";

/// Accepted header spellings per canonical field, compared lowercase and
/// trimmed. Earlier candidates win.
pub const ALIASES: [(&str, &[&str]); 15] = [
    ("timestamp", &["marca temporal", "marca de tiempo", "fecha", "submitted at", "date"]),
    ("age", &["edad", "rango de edad", "age range", "how old are you?"]),
    ("identity", &["identidad de género", "identidad de genero", "gender identity", "identidad"]),
    ("orientation", &["orientación sexual", "orientacion sexual", "sexual orientation", "orientación"]),
    ("platform", &["plataforma", "plataforma principal", "gaming platform", "main platform"]),
    ("play_frequency", &["frecuencia de juego", "¿con qué frecuencia juegas?", "how often do you play?"]),
    ("favorite_genre", &["género favorito", "genero favorito", "favorite genre", "favourite genre"]),
    ("player_gender", &["género del personaje", "genero del personaje", "player character gender", "character gender"]),
    ("representation_rating", &["representación", "representacion", "representation", "how represented do you feel?"]),
    ("orientation_importance", &["importancia de la orientación", "importancia de la orientacion", "orientation importance"]),
    ("inclusive_interest", &["interés por opciones inclusivas", "interes por opciones inclusivas", "interest in inclusive options"]),
    ("customization_importance", &["importancia de la personalización", "importancia de la personalizacion", "customization importance"]),
    ("harassment_experience", &["experiencia de acoso", "acoso", "harassment experience"]),
    ("community_feeling", &["sentimiento de comunidad", "comunidad", "community feeling"]),
    ("recommendation", &["recomendación", "recomendacion", "recommendation", "would you recommend"]),
];

fn header_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Rename source headers onto the canonical schema.
///
/// Columns keep their positions; unmatched columns pass through untouched.
/// Once a column is claimed by a field (exactly or by alias) no other field
/// can rename it.
pub fn normalize(table: &Table) -> Table {
    let keys: Vec<String> = table.columns.iter().map(|c| header_key(c)).collect();
    let mut renamed = table.columns.clone();
    let mut claimed = vec![false; keys.len()];

    // Exact canonical headers claim their column before any alias lookup,
    // so an alias can never steal a column that is already canonical.
    for (field, _) in ALIASES.iter() {
        if let Some(idx) = keys.iter().position(|k| k.as_str() == *field) {
            claimed[idx] = true;
            renamed[idx] = field.to_string();
        }
    }

    for (field, candidates) in ALIASES.iter() {
        if keys.iter().any(|k| k.as_str() == *field) {
            continue;
        }
        let hit = candidates.iter().find_map(|candidate| {
            keys.iter()
                .enumerate()
                .find(|(idx, key)| !claimed[*idx] && key.as_str() == *candidate)
                .map(|(idx, _)| idx)
        });
        if let Some(idx) = hit {
            claimed[idx] = true;
            renamed[idx] = field.to_string();
        }
    }

    Table {
        columns: renamed,
        rows: table.rows.clone(),
    }
}
