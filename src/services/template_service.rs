//! services/template_service.rs
//! Personalización de plantillas, normalización de números y enlaces wa.me.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::models::{campaign_model::ChatLink, recipient_model::Recipient};

/// Valor neutro cuando el contacto no tiene nombre
pub const DEFAULT_NAME: &str = "there";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{(name|phone|address|group)\}").expect("placeholder regex es constante")
});

/// Sustituye `{name}`, `{phone}`/`{address}` y `{group}` (sin distinguir mayúsculas).
/// Los placeholders desconocidos quedan tal cual.
pub fn personalize(template: &str, recipient: &Recipient) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = caps[1].to_ascii_lowercase();
            match key.as_str() {
                "name" => non_blank(&recipient.display_name)
                    .unwrap_or(DEFAULT_NAME)
                    .to_string(),
                "phone" | "address" => recipient.address.trim().to_string(),
                "group" => recipient
                    .group_tag
                    .as_deref()
                    .and_then(non_blank)
                    .unwrap_or_default()
                    .to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn non_blank(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

/// Deja solo dígitos; un 0 inicial se reemplaza por el código de país.
/// `None` si no queda nada utilizable.
pub fn normalize_address(raw: &str, default_country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    match digits.strip_prefix('0') {
        Some(rest) if !default_country_code.is_empty() => {
            if rest.is_empty() {
                None
            } else {
                Some(format!("{default_country_code}{rest}"))
            }
        }
        _ => Some(digits),
    }
}

pub fn wa_me_link(phone_digits: &str, message: &str) -> String {
    format!(
        "https://wa.me/{}?text={}",
        phone_digits,
        urlencoding::encode(message)
    )
}

/// Un enlace por contacto, para enviar a mano sin sesión vinculada.
pub fn chat_links(template: &str, recipients: &[Recipient], default_country_code: &str) -> Vec<ChatLink> {
    recipients
        .iter()
        .map(|r| {
            let message = personalize(template, r);
            let phone = normalize_address(&r.address, default_country_code).unwrap_or_default();
            ChatLink {
                name: r.display_name.clone(),
                link: wa_me_link(&phone, &message),
                phone,
                message,
            }
        })
        .collect()
}

pub fn chat_links_csv(links: &[ChatLink]) -> String {
    let mut csv = String::from("Name,Phone,Message,WhatsApp Link\n");
    for item in links {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csv_field(&item.name),
            csv_field(&item.phone),
            csv_field(&item.message),
            csv_field(&item.link)
        ));
    }
    csv
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(name: &str, address: &str, group: Option<&str>) -> Recipient {
        Recipient {
            id: 1,
            tenant_id: "t1".into(),
            display_name: name.into(),
            address: address.into(),
            group_tag: group.map(str::to_string),
        }
    }

    #[test]
    fn replaces_name_case_insensitively() {
        let r = recipient("Amy", "2330001", None);
        assert_eq!(personalize("Hi {name}!", &r), "Hi Amy!");
        assert_eq!(personalize("Hi {NAME}, {Name}", &r), "Hi Amy, Amy");
    }

    #[test]
    fn missing_fields_fall_back_to_neutral_defaults() {
        let r = recipient("  ", "2330001", None);
        assert_eq!(personalize("Hi {name} from {group}.", &r), "Hi there from .");
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let r = recipient("Bo", "2330002", Some("vip"));
        assert_eq!(
            personalize("{name} ({group}) {coupon} {phone}", &r),
            "Bo (vip) {coupon} 2330002"
        );
    }

    #[test]
    fn normalizes_local_numbers() {
        assert_eq!(normalize_address("055 123 4567", "233").as_deref(), Some("233551234567"));
        assert_eq!(normalize_address("+233 55 123", "233").as_deref(), Some("23355123"));
        assert_eq!(normalize_address("abc", "233"), None);
        assert_eq!(normalize_address("0", "233"), None);
        assert_eq!(normalize_address("0551", "").as_deref(), Some("0551"));
    }

    #[test]
    fn links_are_url_encoded_and_csv_quoted() {
        let rs = vec![recipient("Amy \"A\"", "0550001", None)];
        let links = chat_links("Hi {name} & welcome", &rs, "233");
        assert_eq!(links[0].phone, "233550001");
        assert_eq!(
            links[0].link,
            "https://wa.me/233550001?text=Hi%20Amy%20%22A%22%20%26%20welcome"
        );

        let csv = chat_links_csv(&links);
        assert!(csv.starts_with("Name,Phone,Message,WhatsApp Link\n"));
        assert!(csv.contains("\"Amy \"\"A\"\"\""));
    }
}
