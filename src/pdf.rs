use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::DynamicImage;
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Rect, Rgb,
};

use crate::report::{Block, ReportDocument, ReportError, Table};

// US Letter with half-inch margins.
const PAGE_WIDTH: f32 = 215.9;
const PAGE_HEIGHT: f32 = 279.4;
const MARGIN: f32 = 12.7;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;
const PT_PER_MM: f32 = 2.8346;

const BODY_SIZE: f32 = 10.0;
const PRIMARY: (f32, f32, f32) = (0.118, 0.227, 0.373);
const TEXT: (f32, f32, f32) = (0.2, 0.2, 0.2);
const LIGHT_GRAY: (f32, f32, f32) = (0.953, 0.957, 0.965);
const BORDER: (f32, f32, f32) = (0.82, 0.84, 0.86);
const WHITE: (f32, f32, f32) = (1.0, 1.0, 1.0);

fn pdf_error(e: printpdf::Error) -> ReportError {
    ReportError::Pdf(e.to_string())
}

fn line_height(size: f32) -> f32 {
    size * 1.35 / PT_PER_MM
}

/// Greedy word wrap using an average Helvetica glyph width of half the
/// font size.
pub fn wrap_text(text: &str, size: f32, width_mm: f32) -> Vec<String> {
    let char_mm = size * 0.5 / PT_PER_MM;
    let max_chars = ((width_mm / char_mm).floor() as usize).max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

struct PdfWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    /// Distance of the cursor from the bottom edge.
    y: f32,
    pages: usize,
}

impl PdfWriter {
    fn new(title: &str) -> Result<Self, ReportError> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_error)?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(pdf_error)?;
        let layer = doc.get_page(page).get_layer(layer);
        Ok(PdfWriter {
            doc,
            layer,
            regular,
            bold,
            y: PAGE_HEIGHT - MARGIN,
            pages: 1,
        })
    }

    fn new_page(&mut self) {
        let (page, layer) = self
            .doc
            .add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = PAGE_HEIGHT - MARGIN;
        self.pages += 1;
    }

    fn ensure_space(&mut self, height: f32) {
        if self.y - height < MARGIN && self.y < PAGE_HEIGHT - MARGIN {
            self.new_page();
        }
    }

    fn fill(&self, (r, g, b): (f32, f32, f32)) {
        self.layer.set_fill_color(Color::Rgb(Rgb::new(r, g, b, None)));
    }

    fn rect(&self, x: f32, y: f32, width: f32, height: f32, color: (f32, f32, f32)) {
        self.fill(color);
        self.layer
            .add_rect(Rect::new(Mm(x), Mm(y), Mm(x + width), Mm(y + height)));
    }

    fn text(&self, text: &str, size: f32, x: f32, y: f32, bold: bool, color: (f32, f32, f32)) {
        self.fill(color);
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(text, size, Mm(x), Mm(y), font);
    }

    fn paragraph(&mut self, label: Option<&str>, text: &str) {
        let joined = match label {
            Some(label) => format!("{label} {text}"),
            None => text.to_string(),
        };
        let lh = line_height(BODY_SIZE);
        for (index, line) in wrap_text(&joined, BODY_SIZE, CONTENT_WIDTH).iter().enumerate() {
            self.ensure_space(lh);
            self.y -= lh;
            match label {
                // The label is drawn bold over the start of the first line.
                Some(label) if index == 0 => {
                    let rest = line.strip_prefix(label).unwrap_or(line);
                    self.text(label, BODY_SIZE, MARGIN, self.y, true, TEXT);
                    let offset = (label.chars().count() as f32) * BODY_SIZE * 0.55 / PT_PER_MM;
                    self.text(rest.trim_start(), BODY_SIZE, MARGIN + offset, self.y, false, TEXT);
                }
                _ => self.text(line, BODY_SIZE, MARGIN, self.y, false, TEXT),
            }
        }
        self.y -= 2.0;
    }

    fn heading(&mut self, text: &str, size: f32) {
        let lh = line_height(size);
        self.ensure_space(lh + 10.0);
        self.y -= lh;
        self.text(text, size, MARGIN, self.y, true, PRIMARY);
        self.y -= 3.0;
    }

    fn item_title(&mut self, text: &str) {
        let height = 8.0;
        self.ensure_space(height + 40.0);
        self.y -= height;
        self.rect(MARGIN, self.y, 1.2, height, PRIMARY);
        self.text(text, 12.0, MARGIN + 4.0, self.y + 2.0, true, PRIMARY);
        self.y -= 3.0;
    }

    fn divider(&mut self) {
        self.y -= 2.0;
        self.rect(MARGIN, self.y, CONTENT_WIDTH, 0.7, PRIMARY);
        self.y -= 5.0;
    }

    fn table(&mut self, table: &Table) {
        let lh = line_height(BODY_SIZE);
        let padding = 1.5;
        let widths: Vec<f32> = table.widths.iter().map(|w| w * CONTENT_WIDTH).collect();

        let rows = table
            .header
            .iter()
            .map(|cells| (cells, true))
            .chain(table.rows.iter().map(|cells| (cells, false)));
        for (row_index, (cells, is_header)) in rows.enumerate() {
            let wrapped: Vec<Vec<String>> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| wrap_text(cell, BODY_SIZE, width - 2.0 * padding))
                .collect();
            let lines = wrapped.iter().map(Vec::len).max().unwrap_or(1).max(1);
            let height = lines as f32 * lh + 2.0 * padding;
            self.ensure_space(height);
            self.y -= height;

            let background = if is_header {
                PRIMARY
            } else if row_index % 2 == 0 {
                LIGHT_GRAY
            } else {
                WHITE
            };
            self.rect(MARGIN, self.y, CONTENT_WIDTH, height, background);
            self.rect(MARGIN, self.y, CONTENT_WIDTH, 0.2, BORDER);

            let mut x = MARGIN;
            for (cell_lines, width) in wrapped.iter().zip(&widths) {
                let mut line_y = self.y + height - padding - lh + 1.0;
                for line in cell_lines {
                    let color = if is_header { WHITE } else { TEXT };
                    self.text(line, BODY_SIZE, x + padding, line_y, is_header, color);
                    line_y -= lh;
                }
                x += width;
            }
        }
        self.y -= 2.0;
    }

    fn cards(&mut self, cards: &[(String, String)]) {
        if cards.is_empty() {
            return;
        }
        let gap = 3.0;
        let height = 18.0;
        let width = (CONTENT_WIDTH - gap * (cards.len() as f32 - 1.0)) / cards.len() as f32;
        self.ensure_space(height);
        self.y -= height;
        for (index, (label, value)) in cards.iter().enumerate() {
            let x = MARGIN + index as f32 * (width + gap);
            self.rect(x, self.y, width, height, LIGHT_GRAY);
            self.rect(x, self.y + height - 0.8, width, 0.8, PRIMARY);
            self.text(value, 14.0, x + 3.0, self.y + 8.0, true, PRIMARY);
            self.text(label, 8.0, x + 3.0, self.y + 3.0, false, TEXT);
        }
        self.y -= 4.0;
    }

    fn chart(&mut self, image: &image::RgbImage) {
        let (px_width, px_height) = image.dimensions();
        if px_width == 0 || px_height == 0 {
            return;
        }
        let dpi = px_width as f32 * 25.4 / CONTENT_WIDTH;
        let height = px_height as f32 * 25.4 / dpi;
        self.ensure_space(height);
        self.y -= height;
        let pdf_image = Image::from_dynamic_image(&DynamicImage::ImageRgb8(image.clone()));
        pdf_image.add_to_layer(
            self.layer.clone(),
            ImageTransform {
                translate_x: Some(Mm(MARGIN)),
                translate_y: Some(Mm(self.y)),
                dpi: Some(dpi),
                ..Default::default()
            },
        );
        self.y -= 3.0;
    }

    fn block(&mut self, block: &Block) {
        match block {
            Block::HostHeader(name) => self.heading(name, 20.0),
            Block::Divider => self.divider(),
            Block::Heading(text) => self.heading(text, 12.0),
            Block::Paragraph { label, text } => self.paragraph(label.as_deref(), text),
            Block::Table(table) => self.table(table),
            Block::ItemTitle(text) => self.item_title(text),
            Block::Chart(image) => self.chart(image),
            Block::Cards(cards) => self.cards(cards),
            Block::Spacer(mm) => self.y -= mm,
            Block::PageBreak => self.new_page(),
        }
    }

    fn save(self, path: &Path) -> Result<(), ReportError> {
        let file = File::create(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.doc
            .save(&mut BufWriter::new(file))
            .map_err(pdf_error)
    }
}

/// Lays out `document` on Letter pages and writes it to `path`.
pub fn write_pdf(document: &ReportDocument, path: &Path) -> Result<(), ReportError> {
    let mut writer = PdfWriter::new(&document.title)?;
    for block in &document.blocks {
        writer.block(block);
    }
    log::debug!("Laid out {} page(s) for {}", writer.pages, path.display());
    writer.save(path)
}
