//! Output re-framing of decoded sample bytes.

/// Delivers decoded bytes to the consumer, either as produced or in fixed-size frames.
#[derive(Debug, Default)]
pub struct OutputFramer {
    frame: Vec<u8>,
    position: usize,
}

impl OutputFramer {
    /// Create a framer; `frame_size == 0` selects pass-through delivery.
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame: vec![0u8; frame_size],
            position: 0,
        }
    }

    /// Frame size in bytes, zero in pass-through mode.
    pub fn frame_size(&self) -> usize {
        self.frame.len()
    }

    /// Bytes currently buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.position
    }

    /// Drop any partially filled frame.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Feed a decoded chunk, invoking `sink` once per complete frame.
    pub fn feed(&mut self, mut data: &[u8], sink: &mut dyn FnMut(&[u8])) {
        if data.is_empty() {
            return;
        }

        let frame_size = self.frame.len();
        if frame_size == 0 {
            sink(data);
            return;
        }

        while self.position + data.len() >= frame_size {
            let needed = frame_size - self.position;
            let (head, rest) = data.split_at(needed);

            if self.position > 0 {
                self.frame[self.position..].copy_from_slice(head);
                sink(&self.frame);
            } else {
                sink(head);
            }

            data = rest;
            self.position = 0;
        }

        if !data.is_empty() {
            self.frame[self.position..self.position + data.len()].copy_from_slice(data);
            self.position += data.len();
        }
    }
}
