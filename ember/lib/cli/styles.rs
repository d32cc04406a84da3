use clap::builder::styling::{AnsiColor, Effects, Styles};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Help output palette of the `ember` binary.
pub fn styles() -> Styles {
    let accent = AnsiColor::BrightRed.on_default() | Effects::BOLD;

    Styles::styled()
        .header(accent)
        .usage(accent)
        .literal(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Yellow.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}
