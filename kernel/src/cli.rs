//! Administrative command line
//!
//! A line buffer dispatched against the small fixed command set. Parsing is
//! separate from the side effects so the power paths stay at the platform
//! boundary.

use core::fmt::Write;

/// Commands the console understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Clear,
    PowerOff,
    Shutdown,
    Reboot,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "help" => Some(Self::Help),
            "clear" => Some(Self::Clear),
            "poweroff" => Some(Self::PowerOff),
            "shutdown" => Some(Self::Shutdown),
            "reboot" => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// What the dispatcher wants the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    /// Output written; keep reading lines.
    Continue,
    /// Power the machine down.
    PowerOff,
    /// Warm reboot.
    Reboot,
}

/// Run one input line, writing any response into `out`.
pub fn dispatch(line: &str, out: &mut dyn Write) -> CliAction {
    let Some(command) = Command::parse(line) else {
        if !line.trim().is_empty() {
            let _ = writeln!(out, "unknown command: {}", line.trim());
            let _ = writeln!(out, "type 'help' for the command list");
        }
        return CliAction::Continue;
    };

    match command {
        Command::Help => {
            let _ = writeln!(out, "commands:");
            let _ = writeln!(out, "  help      this list");
            let _ = writeln!(out, "  clear     clear the console");
            let _ = writeln!(out, "  poweroff  power the machine down");
            let _ = writeln!(out, "  shutdown  alias of poweroff");
            let _ = writeln!(out, "  reboot    warm restart");
            CliAction::Continue
        }
        Command::Clear => {
            // ANSI clear + home.
            let _ = write!(out, "\x1b[2J\x1b[H");
            CliAction::Continue
        }
        Command::PowerOff | Command::Shutdown => CliAction::PowerOff,
        Command::Reboot => CliAction::Reboot,
    }
}

/// Perform a power action. Never returns for either variant.
#[cfg(target_os = "none")]
pub fn apply_power_action(action: CliAction) {
    use crate::arch::x86_64::mmu::{outb, outw};

    match action {
        CliAction::PowerOff => {
            crate::klog!(Cli, Info, "powering off");
            // ACPI PM1a on QEMU/Bochs.
            outw(0x604, 0x2000);
            outw(0xB004, 0x2000);
        }
        CliAction::Reboot => {
            crate::klog!(Cli, Info, "rebooting");
            // Keyboard controller pulse of the reset line.
            outb(0x64, 0xFE);
        }
        CliAction::Continue => return,
    }
    crate::arch::x86_64::mmu::halt_forever();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::String;

    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse("help"), Some(Command::Help));
        assert_eq!(Command::parse("  reboot  "), Some(Command::Reboot));
        assert_eq!(Command::parse("shutdown"), Some(Command::Shutdown));
        assert_eq!(Command::parse("frobnicate"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_dispatch_help_lists_commands() {
        let mut out = String::new();
        assert_eq!(dispatch("help", &mut out), CliAction::Continue);
        for name in ["help", "clear", "poweroff", "shutdown", "reboot"] {
            assert!(out.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_dispatch_power_actions() {
        let mut out = String::new();
        assert_eq!(dispatch("poweroff", &mut out), CliAction::PowerOff);
        assert_eq!(dispatch("shutdown", &mut out), CliAction::PowerOff);
        assert_eq!(dispatch("reboot", &mut out), CliAction::Reboot);
    }

    #[test]
    fn test_dispatch_unknown() {
        let mut out = String::new();
        assert_eq!(dispatch("xyzzy", &mut out), CliAction::Continue);
        assert!(out.contains("unknown command"));
        // Blank lines are silent.
        out.clear();
        dispatch("   ", &mut out);
        assert!(out.is_empty());
    }
}
