/// Clothing-change cues (Portuguese and English). Matching is plain
/// case-insensitive substring search; misses are acceptable.
const OUTFIT_CHANGE_KEYWORDS: &[&str] = &[
    "troca de roupa",
    "mudou de roupa",
    "trocou de roupa",
    "roupa de dormir",
    "pijama",
    "fantasia",
    "fantasiado",
    "uniforme",
    "traje",
    "roupa especial",
    "armadura",
    "capacete",
    "roupa de inverno",
    "casaco",
    "jaqueta",
    "agasalho",
    "roupa de verao",
    "roupa de verão",
    "praia",
    "nadar",
    "roupa esportiva",
    "roupa de banho",
    "swimsuit",
    "uniform",
    "pajamas",
    "costume",
    "disguise",
    "armor",
    "helmet",
    "winter coat",
    "jacket",
    "sports outfit",
    "change clothes",
    "changed clothes",
    "outfit change",
];

/// Whether a page may relax the default "same outfit" constraint.
pub fn allows_outfit_change(page_text: &str, image_description: &str) -> bool {
    let combined = format!("{}\n{}", page_text, image_description).to_lowercase();
    OUTFIT_CHANGE_KEYWORDS
        .iter()
        .any(|keyword| combined.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_portuguese_cue_in_text() {
        assert!(allows_outfit_change("Ela vestiu um pijama para dormir", ""));
    }

    #[test]
    fn test_plain_scene_keeps_outfit() {
        assert!(!allows_outfit_change(
            "Eles caminharam pela floresta",
            "walking through the forest"
        ));
    }

    #[test]
    fn test_detects_english_cue_in_description_case_insensitively() {
        assert!(allows_outfit_change(
            "Hora da festa!",
            "Ana wearing a pirate COSTUME at the party"
        ));
    }

    #[test]
    fn test_accented_uppercase_cue() {
        assert!(allows_outfit_change("Foram para a PRAIA de manhã", ""));
        assert!(allows_outfit_change("Ela pegou a ROUPA DE VERÃO", ""));
    }
}
