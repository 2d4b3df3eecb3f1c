//! Wire protocol messages exchanged while discovering and monitoring servers.
use bson::{self, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use Error::{ArgumentError, ResponseError};
use Result;
use wire_protocol::header::{Header, OpCode, HEADER_LENGTH};
use wire_protocol::flags::{OpQueryFlags, OpReplyFlags};

use std::io::{Read, Write};

fn encode(doc: &Document) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    bson::encode_document(&mut buffer, doc)?;
    Ok(buffer)
}

/// Represents a message in the MongoDB Wire Protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    OpReply {
        header: Header,
        flags: OpReplyFlags,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<Document>,
    },
    OpQuery {
        header: Header,
        flags: OpQueryFlags,
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
    },
}

impl Message {
    /// Constructs a new message request for a query.
    pub fn new_query(request_id: i32,
                     flags: OpQueryFlags,
                     namespace: &str,
                     number_to_skip: i32,
                     number_to_return: i32,
                     query: Document)
                     -> Result<Message> {
        // flags, skip and return are three i32s; the namespace is a cstring.
        let body_length = 3 * 4 + namespace.len() as i32 + 1 + encode(&query)?.len() as i32;

        Ok(Message::OpQuery {
            header: Header::new_query(HEADER_LENGTH + body_length, request_id),
            flags: flags,
            namespace: namespace.to_owned(),
            number_to_skip: number_to_skip,
            number_to_return: number_to_return,
            query: query,
        })
    }

    /// Constructs a reply to the request with id `response_to`.
    pub fn new_reply(request_id: i32, response_to: i32, documents: Vec<Document>) -> Result<Message> {
        let mut body_length = 4 + 8 + 4 + 4;
        for doc in &documents {
            body_length += encode(doc)?.len() as i32;
        }

        Ok(Message::OpReply {
            header: Header::new_reply(HEADER_LENGTH + body_length, request_id, response_to),
            flags: OpReplyFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents: documents,
        })
    }

    pub fn header(&self) -> &Header {
        match *self {
            Message::OpReply { ref header, .. } |
            Message::OpQuery { ref header, .. } => header,
        }
    }

    pub fn request_id(&self) -> i32 {
        self.header().request_id
    }

    /// Returns the documents of a reply, or an error for any other message.
    pub fn into_documents(self) -> Result<Vec<Document>> {
        match self {
            Message::OpReply { flags, mut documents, .. } => {
                if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                    let reason = documents.pop()
                        .and_then(|doc| doc.get_str("$err").ok().map(|s| s.to_owned()))
                        .unwrap_or_else(|| "unknown error".to_owned());
                    return Err(ResponseError(format!("Query failed: {}.", reason)));
                }
                Ok(documents)
            }
            Message::OpQuery { .. } => Err(ResponseError("Expected a reply but found a query.".to_owned())),
        }
    }

    fn write_cstring<W: Write + ?Sized>(buffer: &mut W, string: &str) -> Result<()> {
        if string.contains('\0') {
            return Err(ArgumentError(format!("Namespace '{}' contains a null byte.", string)));
        }
        buffer.write_all(string.as_bytes())?;
        buffer.write_u8(0)?;
        Ok(())
    }

    /// Writes the serialized message to a buffer.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            Message::OpQuery { ref header, flags, ref namespace, number_to_skip, number_to_return, ref query } => {
                header.write(buffer)?;
                buffer.write_i32::<LittleEndian>(flags.bits())?;
                Message::write_cstring(buffer, namespace)?;
                buffer.write_i32::<LittleEndian>(number_to_skip)?;
                buffer.write_i32::<LittleEndian>(number_to_return)?;
                buffer.write_all(&encode(query)?)?;
            }
            Message::OpReply { ref header, flags, cursor_id, starting_from, number_returned, ref documents } => {
                header.write(buffer)?;
                buffer.write_i32::<LittleEndian>(flags.bits())?;
                buffer.write_i64::<LittleEndian>(cursor_id)?;
                buffer.write_i32::<LittleEndian>(starting_from)?;
                buffer.write_i32::<LittleEndian>(number_returned)?;
                for doc in documents {
                    buffer.write_all(&encode(doc)?)?;
                }
            }
        }

        buffer.flush()?;
        Ok(())
    }

    // Reads the body of a message whose header has been read, limited to
    // the length the header announced.
    fn read_body<R: Read + ?Sized>(buffer: &mut R, header: Header) -> Result<Message> {
        let mut body = vec![0u8; (header.message_length - HEADER_LENGTH) as usize];
        buffer.read_exact(&mut body)?;
        let mut cursor = &body[..];

        match header.op_code {
            OpCode::Reply => {
                let flags = cursor.read_i32::<LittleEndian>()?;
                let cursor_id = cursor.read_i64::<LittleEndian>()?;
                let starting_from = cursor.read_i32::<LittleEndian>()?;
                let number_returned = cursor.read_i32::<LittleEndian>()?;

                let mut documents = Vec::new();
                while !cursor.is_empty() {
                    documents.push(bson::decode_document(&mut cursor)?);
                }

                Ok(Message::OpReply {
                    header: header,
                    flags: OpReplyFlags::from_bits_truncate(flags),
                    cursor_id: cursor_id,
                    starting_from: starting_from,
                    number_returned: number_returned,
                    documents: documents,
                })
            }
            OpCode::Query => {
                let flags = cursor.read_i32::<LittleEndian>()?;
                let nul = match cursor.iter().position(|b| *b == 0) {
                    Some(nul) => nul,
                    None => return Err(ResponseError("Unterminated namespace in query.".to_owned())),
                };
                let namespace = String::from_utf8_lossy(&cursor[..nul]).into_owned();
                cursor = &cursor[nul + 1..];
                let number_to_skip = cursor.read_i32::<LittleEndian>()?;
                let number_to_return = cursor.read_i32::<LittleEndian>()?;
                let query = bson::decode_document(&mut cursor)?;

                Ok(Message::OpQuery {
                    header: header,
                    flags: OpQueryFlags::from_bits_truncate(flags),
                    namespace: namespace,
                    number_to_skip: number_to_skip,
                    number_to_return: number_to_return,
                    query: query,
                })
            }
        }
    }

    /// Reads one serialized message from a buffer.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        Message::read_body(buffer, header)
    }
}
