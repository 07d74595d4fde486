//! The trivial image builder: every loadable segment of the program is
//! copied to its own load address. No dynamic resolution, no relocation,
//! no stack.
use crate::binary::Binary;
use crate::error::Result;
use crate::image::{Image, ImageSegment};

pub struct SimpleBuilder<'a> {
    program: &'a Binary,
}

impl<'a> SimpleBuilder<'a> {
    pub fn new(program: &'a Binary) -> SimpleBuilder<'a> {
        SimpleBuilder { program }
    }

    /// One image segment per loadable segment, each owning a fresh copy of
    /// the source bytes with the tail zero-filled to the in-memory size.
    pub fn build(&self) -> Result<Image> {
        let mut image = Image::new(self.program.path());
        for (i, view) in self.program.segment_views()?.iter().enumerate() {
            let mut bytes = vec![0u8; view.size as usize];
            if view.has_content {
                let content = self.program.segment_content(i)?;
                let n = content.len().min(bytes.len());
                bytes[..n].copy_from_slice(&content.bytes()[..n]);
            }
            image.add_segment(ImageSegment::new(
                Some(&view.name),
                view.load_address,
                bytes,
                view.writable,
                view.executable,
                Some(0),
            ));
        }
        Ok(image)
    }
}
