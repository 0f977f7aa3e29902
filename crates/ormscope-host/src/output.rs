use std::io::Write;

/// Destination for `print`: nested capture buffers, falling back to stdout.
#[derive(Debug, Default)]
pub struct OutputCapture {
    buffers: Vec<String>,
}

impl OutputCapture {
    pub fn begin(&mut self) {
        self.buffers.push(String::new());
    }

    /// Close the innermost capture and return what it collected.
    pub fn end(&mut self) -> String {
        self.buffers.pop().unwrap_or_default()
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn write(&mut self, text: &str) {
        if let Some(buffer) = self.buffers.last_mut() {
            buffer.push_str(text);
        } else {
            let mut stdout = std::io::stdout().lock();
            // stdout failures are not script failures
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OutputCapture;

    #[test]
    fn nested_captures_collect_separately() {
        let mut output = OutputCapture::default();
        output.begin();
        output.write("outer ");
        output.begin();
        output.write("inner");
        assert_eq!(output.end(), "inner");
        output.write("again");
        assert_eq!(output.end(), "outer again");
        assert!(!output.is_capturing());
    }
}
