use std::io::{self, Write};

/// Follow-up suggestions gathered while a command runs and printed once,
/// after its own output.
#[derive(Debug, Default)]
pub struct NextActions {
    tips: Vec<String>,
}

impl NextActions {
    pub fn push(&mut self, tip: impl Into<String>) {
        let tip = tip.into();
        if !self.tips.contains(&tip) {
            self.tips.push(tip);
        }
    }

    pub fn is_empty(&self) -> bool { self.tips.is_empty() }

    pub fn flush(self, out: &mut impl Write) -> io::Result<()> {
        if self.tips.is_empty() {
            return Ok(());
        }
        writeln!(out)?;
        writeln!(out, "Next steps:")?;
        for tip in &self.tips {
            writeln!(out, "  * {}", tip)?;
        }
        Ok(())
    }
}
