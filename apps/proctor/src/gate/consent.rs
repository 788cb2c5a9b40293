use super::GateError;

/// Multi-page consent and instructions flow. Accepting requires standing on
/// the last page with the acknowledgment box ticked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentFlow {
    pages: usize,
    current: usize,
    acknowledged: bool,
}

impl ConsentFlow {
    pub fn new(pages: usize) -> Self {
        Self {
            pages: pages.max(1),
            current: 0,
            acknowledged: false,
        }
    }

    pub fn page(&self) -> usize {
        self.current
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn on_last_page(&self) -> bool {
        self.current + 1 == self.pages
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn next(&mut self) -> usize {
        if !self.on_last_page() {
            self.current += 1;
        }
        self.current
    }

    /// Leaving the last page clears the acknowledgment.
    pub fn previous(&mut self) -> usize {
        if self.current > 0 {
            self.current -= 1;
            self.acknowledged = false;
        }
        self.current
    }

    pub fn set_acknowledged(&mut self, acknowledged: bool) -> Result<(), GateError> {
        if acknowledged && !self.on_last_page() {
            return Err(GateError::ConsentIncomplete);
        }
        self.acknowledged = acknowledged;
        Ok(())
    }

    pub fn check_accept(&self) -> Result<(), GateError> {
        if !self.on_last_page() {
            return Err(GateError::ConsentIncomplete);
        }
        if !self.acknowledged {
            return Err(GateError::ConsentNotAcknowledged);
        }
        Ok(())
    }
}
