//! Extension to content-type lookup for file-serving convenience.

/// Returns the content type for a file extension (without the dot,
/// case-insensitive). Unknown extensions get `application/octet-stream`.
pub fn content_type_for(extension: &str) -> &'static str {
    // Covers what static-file handlers actually serve; everything exotic
    // falls through to octet-stream.
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "xml" => "text/xml",
        "ics" => "text/calendar",

        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "jsonld" => "application/ld+json",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "bz" => "application/x-bzip",
        "bz2" => "application/x-bzip2",
        "rtf" => "application/rtf",
        "sh" => "application/x-sh",
        "ogx" => "application/ogg",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "epub" => "application/epub+zip",
        "jar" => "application/java-archive",

        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/vnd.microsoft.icon",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",

        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "aac" => "audio/aac",
        "mid" | "midi" => "audio/midi",
        "weba" => "audio/webm",

        "mp4" => "video/mp4",
        "mpeg" => "video/mpeg",
        "webm" => "video/webm",
        "ogv" => "video/ogg",
        "avi" => "video/x-msvideo",
        "ts" => "video/mp2t",
        "3gp" => "video/3gpp",
        "mov" => "video/quicktime",

        "otf" => "font/otf",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",

        _ => "application/octet-stream",
    }
}
