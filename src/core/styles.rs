//! Terminal styling for tables and help output
//!
//! Logical roles map to one `colored::Color` each. Painting is a no-op
//! unless the caller says colour is enabled, so there is no global state.

use clap::builder::styling::AnsiColor;
use colored::{Color, Colorize};

macro_rules! roles {
    ( $( $variant:ident => $color:expr ),+ $(,)? ) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum StyleRole { $( $variant ),+ }

        impl StyleRole {
            pub fn color(self) -> Option<Color> {
                match self { $( StyleRole::$variant => $color ),+ }
            }
        }
    };
}

roles! {
    Header      => Some(Color::Yellow),
    Literal     => Some(Color::Cyan),
    Placeholder => Some(Color::Green),
    Savings     => Some(Color::BrightGreen),
    Error       => Some(Color::BrightRed),
    Pending     => Some(Color::Blue),
    Dim         => Some(Color::BrightBlack),
    Value       => None,
}

impl StyleRole {
    pub fn paint(self, text: &str, enabled: bool) -> String {
        match self.color() {
            Some(color) if enabled => text.color(color).to_string(),
            _ => text.to_string(),
        }
    }

    /// prettytable `style_spec` foreground for this role
    pub fn table_spec(self) -> &'static str {
        match self.color() {
            Some(Color::Yellow) => "Fy",
            Some(Color::Cyan) => "Fc",
            Some(Color::Green) => "Fg",
            Some(Color::BrightGreen) => "FG",
            Some(Color::BrightRed) => "FR",
            Some(Color::Blue) => "Fb",
            Some(Color::BrightBlack) => "FK",
            _ => "",
        }
    }

    fn ansi(self) -> Option<AnsiColor> {
        Some(match self.color()? {
            Color::Yellow => AnsiColor::Yellow,
            Color::Cyan => AnsiColor::Cyan,
            Color::Green => AnsiColor::Green,
            Color::BrightGreen => AnsiColor::BrightGreen,
            Color::BrightRed => AnsiColor::BrightRed,
            Color::Blue => AnsiColor::Blue,
            Color::BrightBlack => AnsiColor::BrightBlack,
            _ => return None,
        })
    }
}

/// clap help styles built from the same roles
pub fn clap_styles(enabled: bool) -> clap::builder::Styles {
    use clap::builder::styling::{Color as ClapColor, Style};
    if !enabled {
        return clap::builder::Styles::plain();
    }
    let style = |role: StyleRole, bold: bool| {
        let s = Style::new().fg_color(role.ansi().map(ClapColor::Ansi));
        if bold {
            s.bold()
        } else {
            s
        }
    };
    clap::builder::Styles::styled()
        .header(style(StyleRole::Header, true))
        .usage(style(StyleRole::Header, true))
        .literal(style(StyleRole::Literal, false))
        .placeholder(style(StyleRole::Placeholder, false))
        .error(style(StyleRole::Error, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_respects_enabled_flag() {
        colored::control::set_override(true);
        let painted = StyleRole::Header.paint("Plugins", true);
        assert!(painted.starts_with("\x1b["));
        assert_eq!(StyleRole::Header.paint("Plugins", false), "Plugins");
        assert_eq!(StyleRole::Value.paint("x", true), "x");
        colored::control::unset_override();
    }

    #[test]
    fn test_table_specs() {
        assert_eq!(StyleRole::Savings.table_spec(), "FG");
        assert_eq!(StyleRole::Value.table_spec(), "");
    }

    #[test]
    fn test_clap_styles_differ_when_enabled() {
        assert_ne!(
            format!("{:?}", clap_styles(false)),
            format!("{:?}", clap_styles(true))
        );
    }
}
