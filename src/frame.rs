use crate::error::Error;

/// FIN bit set plus the text opcode. The only frame type this server speaks.
pub const TEXT_FRAME_TYPE: u8 = 0x81;

const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 0x7E;
const LEN_64: u8 = 0x7F;

/// Where an in-progress receive currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// The type byte is the next thing to receive.
    Type,
    /// The length bytes still have some bytes outstanding.
    Len,
    /// The four mask bytes still have some bytes outstanding.
    Mask,
    /// The payload still has some bytes outstanding.
    Payload,
    /// A complete payload is available.
    Done,
}

/// Resumable decoder for masked client text frames.
///
/// The decoder consumes its input one byte at a time, so a frame may arrive split
/// across any number of TCP reads: whatever state the machine is in when the input
/// runs out is exactly where the next [`FrameDecoder::receive`] call picks up. It
/// performs no I/O.
pub struct FrameDecoder {
    state: DecodeState,
    len_bytes: Vec<u8>,
    computed_length: usize,
    mask: [u8; 4],
    mask_filled: usize,
    mask_index: usize,
    payload: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Type,
            len_bytes: Vec::new(),
            computed_length: 0,
            mask: [0; 4],
            mask_filled: 0,
            mask_index: 0,
            payload: Vec::new(),
        }
    }

    /// Feeds bytes into the state machine, returning the unconsumed tail.
    ///
    /// Consumption stops as soon as one payload completes; the caller takes the
    /// payload with [`FrameDecoder::take_payload`] and feeds the remainder back in.
    /// An input that runs out mid-frame leaves the partial state buffered for the
    /// next call.
    pub fn receive<'a>(&mut self, bytes: &'a [u8]) -> Result<&'a [u8], Error> {
        let mut consumed = 0;
        while consumed < bytes.len() && self.state != DecodeState::Done {
            let b = bytes[consumed];
            consumed += 1;
            match self.state {
                DecodeState::Type => {
                    // This shouldn't be anything but 0x81: a final, unfragmented
                    // text frame. Everything else tears the connection down.
                    if b != TEXT_FRAME_TYPE {
                        return Err(Error::InvalidFrameType(b));
                    }
                    self.state = DecodeState::Len;
                }
                DecodeState::Len => self.receive_len_byte(b)?,
                DecodeState::Mask => {
                    self.mask[self.mask_filled] = b;
                    self.mask_filled += 1;
                    if self.mask_filled == 4 {
                        self.state = if self.computed_length == 0 {
                            DecodeState::Done
                        } else {
                            DecodeState::Payload
                        };
                    }
                }
                DecodeState::Payload => {
                    self.payload.push(b ^ self.mask[self.mask_index]);
                    self.mask_index = (self.mask_index + 1) % 4;
                    if self.payload.len() == self.computed_length {
                        self.state = DecodeState::Done;
                    }
                }
                DecodeState::Done => unreachable!("loop exits on Done"),
            }
        }
        Ok(&bytes[consumed..])
    }

    fn receive_len_byte(&mut self, b: u8) -> Result<(), Error> {
        if self.len_bytes.is_empty() {
            // Clients must mask, so the first length byte carries the mask bit.
            if b & MASK_BIT == 0 {
                return Err(Error::UnmaskedFrame);
            }
            let b = b & 0x7F;
            self.len_bytes.push(b);
            if b < LEN_16 {
                // This is the only length byte we need, on to the masks.
                self.computed_length = b as usize;
                self.state = DecodeState::Mask;
            }
        } else if self.len_bytes[0] == LEN_16 {
            // Two byte length (16 bits), big-endian.
            self.len_bytes.push(b);
            if self.len_bytes.len() == 3 {
                self.computed_length =
                    u16::from_be_bytes([self.len_bytes[1], self.len_bytes[2]]) as usize;
                self.state = DecodeState::Mask;
            }
        } else {
            // Eight byte length (64 bits), big-endian.
            self.len_bytes.push(b);
            if self.len_bytes.len() == 9 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.len_bytes[1..9]);
                self.computed_length = u64::from_be_bytes(raw) as usize;
                self.state = DecodeState::Mask;
            }
        }
        Ok(())
    }

    /// Whether a complete payload is waiting to be taken.
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Takes the completed, unmasked payload and resets the machine for the next
    /// frame. Must only be called when [`FrameDecoder::is_done`] is true.
    pub fn take_payload(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.payload.len(), self.computed_length);
        let payload = std::mem::take(&mut self.payload);
        *self = FrameDecoder::new();
        payload
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes a text payload into a server-to-client wire frame.
///
/// Server frames are never masked: the type byte, the shortest length encoding
/// that fits, then the raw payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(TEXT_FRAME_TYPE);
    if len < LEN_16 as usize {
        frame.push(len as u8);
    } else if len <= 0xFFFF {
        frame.push(LEN_16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(LEN_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}
