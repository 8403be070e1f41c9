use crate::{message::Message, wire::TcpHeader};

/// A TCP segment: a header and the text it carries. Outgoing segments own
/// their text; incoming segments borrow it from the datagram for the
/// duration of processing.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// The sequence space the segment occupies, control bits included.
    pub fn seg_len(&self) -> usize {
        self.text.len() + self.header.ctl.syn() as usize + self.header.ctl.fin() as usize
    }

    pub fn into_inner(self) -> (TcpHeader, Message) {
        (self.header, self.text)
    }
}
