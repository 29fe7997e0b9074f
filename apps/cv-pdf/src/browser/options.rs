const CM_PER_INCH: f64 = 2.54;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaperSize {
    A4,
    Letter,
}

impl PaperSize {
    /// (width, height) in inches.
    pub fn inches(self) -> (f64, f64) {
        match self {
            PaperSize::A4 => (8.27, 11.69),
            PaperSize::Letter => (8.5, 11.0),
        }
    }
}

/// Page margins in centimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Margins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Margins {
    pub fn uniform(cm: f64) -> Self {
        Self {
            top: cm,
            right: cm,
            bottom: cm,
            left: cm,
        }
    }
}

/// Formatting for the printed document. Defaults: A4, backgrounds on, 1 cm margins.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOptions {
    pub paper: PaperSize,
    pub print_background: bool,
    pub margins: Margins,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            paper: PaperSize::A4,
            print_background: true,
            margins: Margins::uniform(1.0),
        }
    }
}

pub fn cm_to_inches(cm: f64) -> f64 {
    cm / CM_PER_INCH
}
